//! Path helpers for turning user-supplied reservation paths into the absolute
//! form the daemon resolves against its mount table.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Make `path` absolute and normalized for reservation requests.
///
/// Reservation targets usually do not exist yet, so instead of canonicalizing
/// the whole path this canonicalizes the deepest ancestor that does exist
/// (resolving symlinked directories onto the volume that really holds them)
/// and re-attaches the remaining components.
pub fn absolutize_request_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };
    let normalized = normalize_syntactic(&absolute);

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return tail
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}
