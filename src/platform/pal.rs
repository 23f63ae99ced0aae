//! PAL trait and platform-specific implementations.
//!
//! Two probes back the ledger: a disk-usage report (`df -P`) that lists the
//! mounted filesystems, and a live free-space query for one mount point. Both
//! sit behind [`Platform`] so admission logic never touches the OS directly.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::core::config::ResolverConfig;
use crate::core::errors::{Result, VrError};

/// OS abstraction used by the resolver and the volume ledgers.
pub trait Platform: Send + Sync {
    /// Raw disk-usage report: a header line followed by one line per mounted
    /// filesystem, mount point last.
    fn disk_usage_report(&self) -> Result<String>;

    /// Bytes currently available to unprivileged writers on `mount_point`.
    fn free_bytes(&self, mount_point: &Path) -> Result<u64>;
}

/// Unix implementation: shells out to `df -P` and calls `statvfs`.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixPlatform {
    df_command: String,
}

#[cfg(unix)]
impl UnixPlatform {
    #[must_use]
    pub fn new(df_command: impl Into<String>) -> Self {
        Self {
            df_command: df_command.into(),
        }
    }
}

#[cfg(unix)]
impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new("df")
    }
}

#[cfg(unix)]
impl Platform for UnixPlatform {
    fn disk_usage_report(&self) -> Result<String> {
        // Fixed argv, no user input reaches the command line.
        let output = std::process::Command::new(&self.df_command)
            .arg("-P")
            .output()
            .map_err(|error| VrError::Resolution {
                details: format!("cannot execute {:?}: {error}", self.df_command),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        // df exits non-zero when a single mount is unreadable (stale NFS, no
        // permission) but still reports every other filesystem.
        if !output.status.success() && stdout.lines().nth(1).is_none() {
            return Err(VrError::Resolution {
                details: format!(
                    "{:?} exited with {}: {}",
                    self.df_command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(stdout)
    }

    #[allow(clippy::useless_conversion)]
    fn free_bytes(&self, mount_point: &Path) -> Result<u64> {
        let stat =
            nix::sys::statvfs::statvfs(mount_point).map_err(|error| VrError::FsStats {
                path: mount_point.to_path_buf(),
                details: error.to_string(),
            })?;
        let fragment = u64::from(stat.fragment_size());
        Ok(u64::from(stat.blocks_available()).saturating_mul(fragment))
    }
}

/// Detect active platform implementation.
pub fn detect_platform(config: &ResolverConfig) -> Result<Arc<dyn Platform>> {
    #[cfg(unix)]
    {
        Ok(Arc::new(UnixPlatform::new(config.df_command.clone())))
    }
    #[cfg(not(unix))]
    {
        let _ = config;
        Err(VrError::UnsupportedPlatform {
            details: "mount resolution needs a POSIX `df`; this platform has none".to_string(),
        })
    }
}

/// In-memory mock implementation for deterministic tests.
///
/// Free space per mount is mutable so tests can simulate other processes
/// filling the disk. Probe failures can be toggled on and off.
#[derive(Debug, Default)]
pub struct MockPlatform {
    mounts: RwLock<Vec<PathBuf>>,
    free_by_mount: RwLock<HashMap<PathBuf, u64>>,
    fail_report: AtomicBool,
    fail_free: AtomicBool,
    probe_delay: RwLock<Option<Duration>>,
    report_calls: AtomicUsize,
    free_calls: AtomicUsize,
}

impl MockPlatform {
    /// Build a mock from `(mount_point, free_bytes)` pairs.
    #[must_use]
    pub fn with_mounts(mounts: &[(&str, u64)]) -> Self {
        let mock = Self::default();
        for (path, free) in mounts {
            mock.add_mount(path, *free);
        }
        mock
    }

    pub fn add_mount(&self, mount_point: &str, free_bytes: u64) {
        let path = PathBuf::from(mount_point);
        {
            let mut mounts = self.mounts.write();
            if !mounts.contains(&path) {
                mounts.push(path.clone());
            }
        }
        self.free_by_mount.write().insert(path, free_bytes);
    }

    pub fn set_free_bytes(&self, mount_point: &str, free_bytes: u64) {
        self.free_by_mount
            .write()
            .insert(PathBuf::from(mount_point), free_bytes);
    }

    pub fn set_fail_report(&self, fail: bool) {
        self.fail_report.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_free(&self, fail: bool) {
        self.fail_free.store(fail, Ordering::SeqCst);
    }

    /// Sleep inside every free-space probe, widening race windows in stress tests.
    pub fn set_probe_delay(&self, delay: Option<Duration>) {
        *self.probe_delay.write() = delay;
    }

    #[must_use]
    pub fn report_calls(&self) -> usize {
        self.report_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::SeqCst)
    }
}

impl Platform for MockPlatform {
    fn disk_usage_report(&self) -> Result<String> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_report.load(Ordering::SeqCst) {
            return Err(VrError::Resolution {
                details: "mock disk-usage probe disabled".to_string(),
            });
        }
        let mounts = self.mounts.read();
        let free = self.free_by_mount.read();
        Ok(render_df_report(
            mounts
                .iter()
                .map(|path| (path.as_path(), free.get(path).copied().unwrap_or(0))),
        ))
    }

    fn free_bytes(&self, mount_point: &Path) -> Result<u64> {
        self.free_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.read();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_free.load(Ordering::SeqCst) {
            return Err(VrError::FsStats {
                path: mount_point.to_path_buf(),
                details: "mock free-space probe disabled".to_string(),
            });
        }
        self.free_by_mount
            .read()
            .get(mount_point)
            .copied()
            .ok_or_else(|| VrError::FsStats {
                path: mount_point.to_path_buf(),
                details: "mock mount not found".to_string(),
            })
    }
}

/// Render a POSIX `df -P` style report, 1024-byte blocks.
fn render_df_report<'a>(mounts: impl Iterator<Item = (&'a Path, u64)>) -> String {
    let mut out = String::from("Filesystem     1024-blocks      Used Available Capacity Mounted on\n");
    for (index, (path, free)) in mounts.enumerate() {
        let available = free / 1024;
        let total = available.saturating_mul(2).max(1);
        let used = total - available;
        let _ = writeln!(
            out,
            "/dev/mock{index:<6} {total:>11} {used:>9} {available:>9} {pct:>7}% {}",
            path.display(),
            pct = used.saturating_mul(100) / total,
        );
    }
    out
}
