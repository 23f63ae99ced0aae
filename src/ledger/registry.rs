//! Registry of volume ledgers, keyed by mount point and created on first use.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::core::config::ResolverConfig;
use crate::ledger::resolver::MountpointResolver;
use crate::ledger::volume::VolumeLedger;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::platform::pal::Platform;

/// Shared map from mount point to its [`VolumeLedger`].
///
/// Lookups take the read lock; creation takes the write lock and re-checks,
/// so at most one ledger ever exists per mount point.
pub struct LedgerRegistry {
    platform: Arc<dyn Platform>,
    resolver: MountpointResolver,
    ledgers: RwLock<HashMap<String, Arc<VolumeLedger>>>,
    activity: Option<ActivityLoggerHandle>,
}

impl LedgerRegistry {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, config: &ResolverConfig) -> Self {
        let resolver = MountpointResolver::new(
            Arc::clone(&platform),
            Duration::from_millis(config.mount_cache_ttl_ms),
        );
        Self {
            platform,
            resolver,
            ledgers: RwLock::new(HashMap::new()),
            activity: None,
        }
    }

    /// Report resolution fallbacks through the activity log instead of stderr.
    #[must_use]
    pub fn with_activity_logger(mut self, handle: ActivityLoggerHandle) -> Self {
        self.activity = Some(handle);
        self
    }

    #[must_use]
    pub fn resolver(&self) -> &MountpointResolver {
        &self.resolver
    }

    /// Ledger for `mount_point`, created empty if it does not exist yet.
    pub fn get_or_create(&self, mount_point: &str) -> Arc<VolumeLedger> {
        if let Some(ledger) = self.ledgers.read().get(mount_point) {
            return Arc::clone(ledger);
        }
        let mut ledgers = self.ledgers.write();
        Arc::clone(
            ledgers
                .entry(mount_point.to_string())
                .or_insert_with(|| {
                    Arc::new(VolumeLedger::new(mount_point, Arc::clone(&self.platform)))
                }),
        )
    }

    /// Ledger of the volume holding `path`.
    ///
    /// Resolution never fails from the caller's point of view: when the mount
    /// table cannot be read or nothing matches, the path is booked against
    /// `/` and the failure is logged.
    pub fn ledger_for_path(&self, path: &str) -> Arc<VolumeLedger> {
        let resolution = self.resolver.resolve_or_root(path);
        if let Some(error) = resolution.fallback_reason {
            match &self.activity {
                Some(handle) => handle.send(ActivityEvent::ResolutionFallback {
                    path: path.to_string(),
                    error_code: error.code().to_string(),
                    error_message: error.to_string(),
                }),
                None => eprintln!(
                    "[VR-RESOLVE] falling back to {} for {path:?}: {error}",
                    resolution.mount_point
                ),
            }
        }
        self.get_or_create(&resolution.mount_point)
    }

    /// Mount points that currently have a ledger, sorted.
    #[must_use]
    pub fn mount_points(&self) -> Vec<String> {
        let mut mounts: Vec<String> = self.ledgers.read().keys().cloned().collect();
        mounts.sort();
        mounts
    }

    #[must_use]
    pub fn ledger_count(&self) -> usize {
        self.ledgers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::activity::{ActivityLoggerConfig, spawn_logger};
    use crate::logger::jsonl::{JsonlConfig, Severity};
    use crate::platform::pal::MockPlatform;
    use std::sync::Barrier;
    use std::thread;

    fn registry(mounts: &[(&str, u64)]) -> (Arc<MockPlatform>, LedgerRegistry) {
        let platform = Arc::new(MockPlatform::with_mounts(mounts));
        let registry = LedgerRegistry::new(platform.clone(), &ResolverConfig::default());
        (platform, registry)
    }

    #[test]
    fn same_mount_returns_same_ledger() {
        let (_, registry) = registry(&[("/", 1 << 20)]);
        let a = registry.get_or_create("/");
        let b = registry.get_or_create("/");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.ledger_count(), 1);
    }

    #[test]
    fn paths_route_to_their_volume() {
        let (_, registry) = registry(&[("/", 1 << 20), ("/mnt/data", 1 << 30)]);
        let data = registry.ledger_for_path("/mnt/data/run/bag.tar");
        let root = registry.ledger_for_path("/tmp/scratch");
        assert_eq!(data.mount_point(), "/mnt/data");
        assert_eq!(root.mount_point(), "/");
        assert_eq!(registry.mount_points(), vec!["/", "/mnt/data"]);
    }

    #[test]
    fn reservations_on_different_volumes_are_independent() {
        let (_, registry) = registry(&[("/", 1_000), ("/mnt/data", 1_000)]);
        registry.ledger_for_path("/a").reserve("/a", 1_000).unwrap();
        registry
            .ledger_for_path("/mnt/data/b")
            .reserve("/mnt/data/b", 1_000)
            .unwrap();
        assert_eq!(registry.get_or_create("/").reserved_total(), 1_000);
        assert_eq!(registry.get_or_create("/mnt/data").reserved_total(), 1_000);
    }

    #[test]
    fn resolution_failure_falls_back_to_root_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("activity.jsonl");
        let (handle, join) = spawn_logger(ActivityLoggerConfig {
            jsonl: JsonlConfig {
                path: Some(log_path.clone()),
                fallback_path: None,
                min_severity: Severity::Info,
                max_size_bytes: 1 << 20,
                max_rotated_files: 1,
                fsync_interval_secs: 60,
            },
            channel_capacity: 16,
        })
        .unwrap();

        let (platform, registry) = registry(&[("/", 1 << 20), ("/mnt/data", 1 << 20)]);
        let registry = registry.with_activity_logger(handle.clone());
        platform.set_fail_report(true);

        let ledger = registry.ledger_for_path("/mnt/data/file");
        assert_eq!(ledger.mount_point(), "/");

        handle.shutdown();
        join.join().unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("\"resolution_fallback\""), "{log}");
        assert!(log.contains("VR-2101"), "{log}");
    }

    #[test]
    fn concurrent_first_use_creates_one_ledger() {
        let (_, registry) = registry(&[("/", 1 << 20)]);
        let registry = Arc::new(registry);
        let threads = 12;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("/")
                })
            })
            .collect();
        let ledgers: Vec<Arc<VolumeLedger>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.ledger_count(), 1);
        assert!(ledgers.iter().all(|l| Arc::ptr_eq(l, &ledgers[0])));
    }
}
