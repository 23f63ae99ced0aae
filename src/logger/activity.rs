//! Activity logger: a dedicated thread owns the [`JsonlWriter`]; request
//! workers hand it events through a bounded crossbeam channel.
//!
//! `send()` never blocks. When the channel is full the event is counted and
//! dropped, and the logger thread reports the loss on its next write.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, VrError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 1024;

/// Events the daemon records.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        listen_addr: String,
        config_hash: String,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    Reserved {
        remote_addr: String,
        path: String,
        bytes: u64,
        mount_point: String,
        replaced: Option<u64>,
        free_bytes: u64,
        reserved_total: u64,
        duration_ms: u64,
    },
    ReserveRejected {
        remote_addr: String,
        path: String,
        bytes: u64,
        mount_point: String,
        status: u16,
        error_code: String,
        error_message: String,
    },
    Released {
        remote_addr: String,
        path: String,
        mount_point: String,
        released_bytes: Option<u64>,
    },
    Reported {
        remote_addr: String,
        path: String,
        mount_point: String,
        entries: usize,
    },
    /// Parameter validation or routing failure before any ledger was touched.
    RequestRejected {
        remote_addr: String,
        route: String,
        status: u16,
        message: String,
    },
    /// Mount resolution failed and the request was booked against `/`.
    ResolutionFallback {
        path: String,
        error_code: String,
        error_message: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to stop the logger thread.
    Shutdown,
}

/// Cheaply cloneable handle for sending events to the logger thread.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl std::fmt::Debug for ActivityLoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLoggerHandle")
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl ActivityLoggerHandle {
    /// Queue an event. Non-blocking; drops and counts the event when full.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Events dropped since the logger thread last reported them.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only until the
    /// sentinel is queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Options for the logger thread.
#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self {
            jsonl: JsonlConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread.
///
/// The thread runs until [`ActivityLoggerHandle::shutdown`] is called or
/// every handle is dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("vreserve-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped_clone))
        .map_err(|e| VrError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl_config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        jsonl.write_entry(&event_to_log_entry(event));
        if rx.is_empty() {
            jsonl.flush();
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

fn event_to_log_entry(event: ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::DaemonStarted {
            version,
            listen_addr,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStart, Severity::Info);
            e.details = Some(format!(
                "version={version} listen={listen_addr} config_hash={config_hash}"
            ));
            e.ok = Some(true);
            e
        }
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::Reserved {
            remote_addr,
            path,
            bytes,
            mount_point,
            replaced,
            free_bytes,
            reserved_total,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::Reserve, Severity::Info);
            e.remote_addr = Some(remote_addr);
            e.path = Some(path);
            e.bytes = Some(bytes);
            e.mount_point = Some(mount_point);
            e.free_bytes = Some(free_bytes);
            e.reserved_total = Some(reserved_total);
            e.duration_ms = Some(duration_ms);
            e.details = replaced.map(|previous| format!("replaced={previous}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ReserveRejected {
            remote_addr,
            path,
            bytes,
            mount_point,
            status,
            error_code,
            error_message,
        } => {
            let severity = if status >= 500 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            let mut e = LogEntry::new(EventType::ReserveRejected, severity);
            e.remote_addr = Some(remote_addr);
            e.path = Some(path);
            e.bytes = Some(bytes);
            e.mount_point = Some(mount_point);
            e.status = Some(status);
            e.error_code = Some(error_code);
            e.error_message = Some(error_message);
            e.ok = Some(false);
            e
        }
        ActivityEvent::Released {
            remote_addr,
            path,
            mount_point,
            released_bytes,
        } => {
            let mut e = LogEntry::new(EventType::Release, Severity::Info);
            e.remote_addr = Some(remote_addr);
            e.path = Some(path);
            e.mount_point = Some(mount_point);
            e.bytes = released_bytes;
            if released_bytes.is_none() {
                e.details = Some("no reservation held".to_string());
            }
            e.ok = Some(true);
            e
        }
        ActivityEvent::Reported {
            remote_addr,
            path,
            mount_point,
            entries,
        } => {
            let mut e = LogEntry::new(EventType::Report, Severity::Info);
            e.remote_addr = Some(remote_addr);
            e.path = Some(path);
            e.mount_point = Some(mount_point);
            e.details = Some(format!("entries={entries}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::RequestRejected {
            remote_addr,
            route,
            status,
            message,
        } => {
            let mut e = LogEntry::new(EventType::RequestRejected, Severity::Warning);
            e.remote_addr = Some(remote_addr);
            e.status = Some(status);
            e.error_message = Some(message);
            e.details = Some(format!("route={route}"));
            e.ok = Some(false);
            e
        }
        ActivityEvent::ResolutionFallback {
            path,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::ResolutionFallback, Severity::Warning);
            e.path = Some(path);
            e.mount_point = Some("/".to_string());
            e.error_code = Some(error_code);
            e.error_message = Some(error_message);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code);
            e.error_message = Some(message);
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::DaemonStop, Severity::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn test_config(dir: &Path) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl: JsonlConfig {
                path: Some(dir.join("activity.jsonl")),
                fallback_path: None,
                min_severity: Severity::Info,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 2,
                fsync_interval_secs: 60,
            },
            channel_capacity: 64,
        }
    }

    fn read_lines(path: &PathBuf) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();

        handle.send(ActivityEvent::DaemonStarted {
            version: "0.0.0".to_string(),
            listen_addr: "127.0.0.1:8188".to_string(),
            config_hash: "abc".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(&dir.path().join("activity.jsonl"));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], "daemon_start");
        assert!(lines[0]["details"].as_str().unwrap().contains("127.0.0.1:8188"));
    }

    #[test]
    fn request_events_carry_structured_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();

        handle.send(ActivityEvent::Reserved {
            remote_addr: "127.0.0.1:40000".to_string(),
            path: "/mnt/data/a".to_string(),
            bytes: 4096,
            mount_point: "/mnt/data".to_string(),
            replaced: Some(1024),
            free_bytes: 1 << 20,
            reserved_total: 4096,
            duration_ms: 1,
        });
        handle.send(ActivityEvent::ReserveRejected {
            remote_addr: "127.0.0.1:40001".to_string(),
            path: "/mnt/data/b".to_string(),
            bytes: 1 << 40,
            mount_point: "/mnt/data".to_string(),
            status: 409,
            error_code: "VR-2002".to_string(),
            error_message: "insufficient".to_string(),
        });
        handle.send(ActivityEvent::Released {
            remote_addr: "127.0.0.1:40002".to_string(),
            path: "/mnt/data/zzz".to_string(),
            mount_point: "/mnt/data".to_string(),
            released_bytes: None,
        });
        handle.send(ActivityEvent::ResolutionFallback {
            path: "/x".to_string(),
            error_code: "VR-2101".to_string(),
            error_message: "df failed".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(&dir.path().join("activity.jsonl"));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["event"], "reserve");
        assert_eq!(lines[0]["mount_point"], "/mnt/data");
        assert_eq!(lines[0]["details"], "replaced=1024");
        assert_eq!(lines[1]["event"], "reserve_rejected");
        assert_eq!(lines[1]["severity"], "warning");
        assert_eq!(lines[1]["status"], 409);
        assert_eq!(lines[2]["event"], "release");
        assert!(lines[2].get("bytes").is_none());
        assert_eq!(lines[3]["event"], "resolution_fallback");
        assert_eq!(lines[3]["mount_point"], "/");
    }

    #[test]
    fn handles_are_cloneable_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let h = handle.clone();
                thread::spawn(move || {
                    h.send(ActivityEvent::Error {
                        code: "VR-3900".to_string(),
                        message: format!("worker {i}"),
                    });
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        handle.shutdown();
        join.join().unwrap();

        let lines = read_lines(&dir.path().join("activity.jsonl"));
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l["severity"] == "critical"));
    }

    #[test]
    fn dropped_events_counted() {
        let (tx, _rx) = bounded::<ActivityEvent>(1);
        let handle = ActivityLoggerHandle {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..5 {
            handle.send(ActivityEvent::Error {
                code: "VR-3900".to_string(),
                message: "flood".to_string(),
            });
        }
        assert_eq!(handle.dropped_events(), 4);
    }

    #[test]
    fn drop_all_handles_stops_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        drop(handle);
        join.join().unwrap();
    }
}
