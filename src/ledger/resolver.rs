//! Mount-point resolution: maps an arbitrary path to the mounted volume that
//! will absorb its bytes, using the platform's disk-usage report.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::core::errors::{Result, VrError};
use crate::platform::pal::Platform;

/// Mount point every absolute path lives under; the degraded answer when
/// resolution fails.
pub const ROOT_MOUNT: &str = "/";

/// Outcome of [`MountpointResolver::resolve_or_root`].
#[derive(Debug)]
pub struct Resolution {
    pub mount_point: String,
    /// Set when resolution failed and `mount_point` is the root fallback.
    pub fallback_reason: Option<VrError>,
}

/// Longest-prefix mount resolver over a (optionally cached) mount table.
pub struct MountpointResolver {
    platform: Arc<dyn Platform>,
    cache_ttl: Duration,
    cache: RwLock<Option<(Arc<Vec<String>>, Instant)>>,
}

impl MountpointResolver {
    /// `cache_ttl` of zero re-reads the mount table on every call.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, cache_ttl: Duration) -> Self {
        Self {
            platform,
            cache_ttl,
            cache: RwLock::new(None),
        }
    }

    /// Current mount points, in report order.
    pub fn mount_points(&self) -> Result<Arc<Vec<String>>> {
        if !self.cache_ttl.is_zero() {
            let cache = self.cache.read();
            if let Some((mounts, collected_at)) = &*cache
                && collected_at.elapsed() < self.cache_ttl
            {
                return Ok(Arc::clone(mounts));
            }
        }

        let raw = self.platform.disk_usage_report()?;
        let mounts = parse_disk_usage_report(&raw);
        if mounts.is_empty() {
            return Err(VrError::Resolution {
                details: "disk-usage report listed no mount points".to_string(),
            });
        }
        let mounts = Arc::new(mounts);
        if !self.cache_ttl.is_zero() {
            *self.cache.write() = Some((Arc::clone(&mounts), Instant::now()));
        }
        Ok(mounts)
    }

    /// Mount point holding `path`.
    ///
    /// Fails when the probe fails or no mount point contains `path`.
    pub fn resolve(&self, path: &str) -> Result<String> {
        let mounts = self.mount_points()?;
        longest_prefix_mount(path, &mounts)
            .map(str::to_string)
            .ok_or_else(|| VrError::Resolution {
                details: format!("no mount point contains {path:?}"),
            })
    }

    /// Like [`resolve`](Self::resolve), but degrades to [`ROOT_MOUNT`]
    /// instead of failing. The failure is handed back for the caller to report.
    pub fn resolve_or_root(&self, path: &str) -> Resolution {
        match self.resolve(path) {
            Ok(mount_point) => Resolution {
                mount_point,
                fallback_reason: None,
            },
            Err(error) => Resolution {
                mount_point: ROOT_MOUNT.to_string(),
                fallback_reason: Some(error),
            },
        }
    }
}

/// Extract mount points from a disk-usage report, skipping the header line.
///
/// The mount point is the last column. In the POSIX (`df -P`) layout it is
/// everything after the capacity column, which keeps mount points containing
/// spaces intact; other layouts fall back to the last whitespace-delimited
/// field. Duplicate entries (over-mounts) are reported once.
pub fn parse_disk_usage_report(raw: &str) -> Vec<String> {
    let mut mounts: Vec<String> = Vec::new();
    for line in raw.lines().skip(1) {
        let Some(mount) = mount_field(line) else {
            continue;
        };
        if !mounts.iter().any(|known| known == mount) {
            mounts.push(mount.to_string());
        }
    }
    mounts
}

fn mount_field(line: &str) -> Option<&str> {
    let mut rest = line.trim();
    if rest.is_empty() {
        return None;
    }
    // Filesystem, blocks, used, available, capacity.
    for column in 0..5 {
        let end = rest.find(char::is_whitespace)?;
        let token = &rest[..end];
        rest = rest[end..].trim_start();
        if column == 4 && token.ends_with('%') && !rest.is_empty() {
            return Some(rest.trim_end());
        }
    }
    line.split_whitespace().last()
}

/// Pick the longest mount point that contains `path`.
///
/// Containment respects component boundaries: `/mnt/data` holds
/// `/mnt/data` and `/mnt/data/x` but not `/mnt/database`.
pub fn longest_prefix_mount<'a>(path: &str, mounts: &'a [String]) -> Option<&'a str> {
    mounts
        .iter()
        .map(String::as_str)
        .filter(|mount| mount_contains(mount, path))
        .max_by_key(|mount| mount.len())
}

fn mount_contains(mount: &str, path: &str) -> bool {
    let Some(rest) = path.strip_prefix(mount) else {
        return false;
    };
    rest.is_empty() || mount.ends_with('/') || rest.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::pal::MockPlatform;
    use proptest::prelude::*;

    const LINUX_DF: &str = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/nvme0n1p2   490617784 182400112 283216396      40% /
tmpfs             16321540         0  16321540       0% /dev/shm
/dev/nvme0n1p1     1046508     6288   1040220       1% /boot/efi
/dev/sdb1       3844551496 123456789 3525827203      4% /mnt/data
//nas/share     1000000000 500000000 500000000      50% /mnt/my share
";

    fn mounts(list: &[&str]) -> Vec<String> {
        list.iter().map(|m| (*m).to_string()).collect()
    }

    #[test]
    fn parses_posix_report_skipping_header() {
        let parsed = parse_disk_usage_report(LINUX_DF);
        assert_eq!(
            parsed,
            mounts(&["/", "/dev/shm", "/boot/efi", "/mnt/data", "/mnt/my share"])
        );
    }

    #[test]
    fn falls_back_to_last_field_for_plain_layout() {
        let raw = "Filesystem Size Mounted\nrootfs 10G /\nweird /srv\n\n";
        assert_eq!(parse_disk_usage_report(raw), mounts(&["/", "/srv"]));
    }

    #[test]
    fn duplicate_mounts_reported_once() {
        let raw = "\
Filesystem 1024-blocks Used Available Capacity Mounted on
overlay 100 50 50 50% /
/dev/sda1 100 50 50 50% /
";
        assert_eq!(parse_disk_usage_report(raw), mounts(&["/"]));
    }

    #[test]
    fn header_only_report_is_empty() {
        assert!(parse_disk_usage_report("Filesystem 1024-blocks Used Available Capacity Mounted on\n").is_empty());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = mounts(&["/", "/mnt/data"]);
        assert_eq!(
            longest_prefix_mount("/mnt/data/file.txt", &table),
            Some("/mnt/data")
        );
        assert_eq!(longest_prefix_mount("/tmp/x", &table), Some("/"));
        assert_eq!(longest_prefix_mount("/mnt/data", &table), Some("/mnt/data"));
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_contained() {
        let table = mounts(&["/", "/mnt/data"]);
        assert_eq!(longest_prefix_mount("/mnt/database/x", &table), Some("/"));
    }

    #[test]
    fn relative_path_matches_nothing() {
        let table = mounts(&["/", "/mnt/data"]);
        assert_eq!(longest_prefix_mount("relative/file", &table), None);
    }

    #[test]
    fn resolve_uses_platform_report() {
        let platform = Arc::new(MockPlatform::with_mounts(&[
            ("/", 1 << 20),
            ("/mnt/data", 1 << 30),
        ]));
        let resolver = MountpointResolver::new(platform, Duration::ZERO);
        assert_eq!(resolver.resolve("/mnt/data/bag.tar").unwrap(), "/mnt/data");
        assert_eq!(resolver.resolve("/tmp/x").unwrap(), "/");
    }

    #[test]
    fn resolve_without_cache_reprobes_every_call() {
        let platform = Arc::new(MockPlatform::with_mounts(&[("/", 1 << 20)]));
        let resolver = MountpointResolver::new(platform.clone(), Duration::ZERO);
        resolver.resolve("/a").unwrap();
        resolver.resolve("/b").unwrap();
        assert_eq!(platform.report_calls(), 2);
    }

    #[test]
    fn resolve_with_cache_probes_once() {
        let platform = Arc::new(MockPlatform::with_mounts(&[("/", 1 << 20)]));
        let resolver = MountpointResolver::new(platform.clone(), Duration::from_secs(60));
        resolver.resolve("/a").unwrap();
        resolver.resolve("/b").unwrap();
        assert_eq!(platform.report_calls(), 1);
    }

    #[test]
    fn new_mount_visible_without_cache() {
        let platform = Arc::new(MockPlatform::with_mounts(&[("/", 1 << 20)]));
        let resolver = MountpointResolver::new(platform.clone(), Duration::ZERO);
        assert_eq!(resolver.resolve("/mnt/usb/file").unwrap(), "/");
        platform.add_mount("/mnt/usb", 1 << 20);
        assert_eq!(resolver.resolve("/mnt/usb/file").unwrap(), "/mnt/usb");
    }

    #[test]
    fn probe_failure_degrades_to_root() {
        let platform = Arc::new(MockPlatform::with_mounts(&[("/mnt/data", 1)]));
        platform.set_fail_report(true);
        let resolver = MountpointResolver::new(platform, Duration::ZERO);

        assert!(matches!(
            resolver.resolve("/mnt/data/x"),
            Err(VrError::Resolution { .. })
        ));
        let resolution = resolver.resolve_or_root("/mnt/data/x");
        assert_eq!(resolution.mount_point, ROOT_MOUNT);
        assert!(resolution.fallback_reason.is_some());
    }

    #[test]
    fn unmatched_path_degrades_to_root() {
        let platform = Arc::new(MockPlatform::with_mounts(&[("/mnt/data", 1)]));
        let resolver = MountpointResolver::new(platform, Duration::ZERO);
        let resolution = resolver.resolve_or_root("/srv/elsewhere");
        assert_eq!(resolution.mount_point, "/");
        let reason = resolution.fallback_reason.expect("fallback reason");
        assert!(reason.to_string().contains("no mount point contains"));
    }

    #[test]
    fn successful_resolution_has_no_fallback_reason() {
        let platform = Arc::new(MockPlatform::with_mounts(&[("/", 1)]));
        let resolver = MountpointResolver::new(platform, Duration::ZERO);
        let resolution = resolver.resolve_or_root("/var/tmp/x");
        assert_eq!(resolution.mount_point, "/");
        assert!(resolution.fallback_reason.is_none());
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn resolved_mount_is_longest_containing_prefix(
            mount_segments in prop::collection::vec(prop::collection::vec(segment(), 1..4), 0..6),
            path_segments in prop::collection::vec(segment(), 0..6),
        ) {
            let mut table = vec![ROOT_MOUNT.to_string()];
            for segs in &mount_segments {
                table.push(format!("/{}", segs.join("/")));
            }
            let path = format!("/{}", path_segments.join("/"));

            let chosen = longest_prefix_mount(&path, &table).expect("root always matches");
            prop_assert!(mount_contains(chosen, &path));
            for candidate in &table {
                if mount_contains(candidate, &path) {
                    prop_assert!(candidate.len() <= chosen.len());
                }
            }
        }
    }
}
