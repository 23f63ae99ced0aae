//! Daemon lifecycle: start the logger, registry and HTTP workers, wait for a
//! shutdown signal, then tear everything down in order.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::Config;
use crate::core::errors::{Result, VrError};
use crate::daemon::server::{ServiceHandle, VolumeService};
use crate::daemon::signals::{ShutdownCoordinator, SignalHandler};
use crate::ledger::registry::LedgerRegistry;
use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use crate::logger::jsonl::JsonlConfig;
use crate::platform::pal::{Platform, detect_platform};

/// How often the main thread checks the shutdown flag.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running reservation daemon.
pub struct VolumeDaemon {
    registry: Arc<LedgerRegistry>,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    service: Option<ServiceHandle>,
    local_addr: SocketAddr,
    start_time: Instant,
}

impl VolumeDaemon {
    /// Start the daemon on the host platform.
    pub fn start(config: &Config) -> Result<Self> {
        let platform = detect_platform(&config.resolver)?;
        Self::start_with_platform(config, platform)
    }

    /// Start the daemon against an explicit platform (tests use `MockPlatform`).
    pub fn start_with_platform(config: &Config, platform: Arc<dyn Platform>) -> Result<Self> {
        let start_time = Instant::now();

        // 1. Logger.
        let (logger_handle, logger_join) = spawn_logger(ActivityLoggerConfig {
            jsonl: JsonlConfig::from(&config.logging),
            ..ActivityLoggerConfig::default()
        })?;

        // 2. Registry.
        let registry = Arc::new(
            LedgerRegistry::new(platform, &config.resolver)
                .with_activity_logger(logger_handle.clone()),
        );

        // 3. HTTP workers.
        let service = VolumeService::bind(&config.server, Arc::clone(&registry), logger_handle.clone())
            .and_then(VolumeService::spawn);
        let service = match service {
            Ok(service) => service,
            Err(error) => {
                logger_handle.send(ActivityEvent::Error {
                    code: error.code().to_string(),
                    message: error.to_string(),
                });
                logger_handle.shutdown();
                let _ = logger_join.join();
                return Err(error);
            }
        };
        let local_addr = service.local_addr();

        logger_handle.send(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: local_addr.to_string(),
            config_hash: config.stable_hash().unwrap_or_default(),
        });

        Ok(Self {
            registry,
            logger_handle,
            logger_join: Some(logger_join),
            service: Some(service),
            local_addr,
            start_time,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<LedgerRegistry> {
        &self.registry
    }

    /// Block until `signals` requests shutdown, then stop.
    pub fn run(self, signals: &SignalHandler) -> Result<()> {
        while !signals.should_shutdown() {
            thread::sleep(SIGNAL_POLL_INTERVAL);
        }
        eprintln!("[VR-DAEMON] shutdown requested");
        self.shutdown("signal")
    }

    /// Stop the HTTP workers, record the stop, and drain the logger.
    pub fn shutdown(mut self, reason: &str) -> Result<()> {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let mut service = self.service.take();
        let mut service_error: Option<VrError> = None;
        let logger_handle = self.logger_handle.clone();
        let mut logger_join = self.logger_join.take();

        let mut stop_workers = || match service.take() {
            Some(handle) => match handle.shutdown() {
                Ok(()) => true,
                Err(error) => {
                    service_error = Some(error);
                    false
                }
            },
            None => true,
        };
        let mut drain_logger = || {
            logger_handle.send(ActivityEvent::DaemonStopped {
                reason: reason.to_string(),
                uptime_secs,
            });
            logger_handle.shutdown();
            logger_join.take().is_none_or(|join| join.join().is_ok())
        };
        let clean = {
            let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> = vec![
                ("http workers", &mut stop_workers),
                ("activity log", &mut drain_logger),
            ];
            ShutdownCoordinator::default().execute(&mut steps)
        };

        eprintln!("[VR-DAEMON] shutdown complete (uptime={uptime_secs}s)");
        if let Some(error) = service_error {
            return Err(error);
        }
        if !clean {
            return Err(VrError::Runtime {
                details: "shutdown did not complete cleanly".to_string(),
            });
        }
        Ok(())
    }
}

/// Run the daemon until SIGTERM/SIGINT. `on_ready` receives the bound address.
pub fn run_daemon(config: &Config, on_ready: impl FnOnce(SocketAddr)) -> Result<()> {
    let signals = SignalHandler::new();
    let daemon = VolumeDaemon::start(config)?;
    on_ready(daemon.local_addr());
    daemon.run(&signals)
}
