//! Signal handling: SIGTERM/SIGINT request a graceful shutdown.
//!
//! Registration goes through `signal-hook` flags; the daemon polls
//! [`SignalHandler::should_shutdown`] rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Shutdown flag shared between the OS signal handler and the daemon.
#[derive(Clone, Debug)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register SIGTERM/SIGINT.
    ///
    /// Registration is best-effort; failures go to stderr.
    #[must_use]
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// Handler not wired to any OS signal; shutdown only via
    /// [`request_shutdown`](Self::request_shutdown).
    #[must_use]
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag)) {
                eprintln!("[VR-SIGNAL] failed to register {name}: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs named shutdown steps in order under an overall deadline.
pub struct ShutdownCoordinator {
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run every step; `true` when all of them succeeded before the deadline.
    pub fn execute(&self, steps: &mut [(&str, &mut dyn FnMut() -> bool)]) -> bool {
        let start = Instant::now();
        let mut all_ok = true;

        for (name, step) in steps.iter_mut() {
            if start.elapsed() > self.timeout {
                eprintln!("[VR-SHUTDOWN] timeout reached, abandoning remaining steps");
                return false;
            }
            if !step() {
                eprintln!("[VR-SHUTDOWN] {name}: failed");
                all_ok = false;
            }
            if start.elapsed() > self.timeout {
                eprintln!("[VR-SHUTDOWN] {name}: overran the {:?} deadline", self.timeout);
                return false;
            }
        }

        all_ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handler_starts_clear() {
        let handler = SignalHandler::detached();
        assert!(!handler.should_shutdown());
    }

    #[test]
    fn programmatic_shutdown_is_shared_by_clones() {
        let handler = SignalHandler::detached();
        let clone = handler.clone();
        handler.request_shutdown();
        assert!(clone.should_shutdown());
    }

    #[test]
    fn coordinator_runs_steps_in_order() {
        let mut order = Vec::new();
        let mut first = || {
            order.push("first");
            true
        };
        let mut second = || true;
        {
            let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> =
                vec![("first", &mut first), ("second", &mut second)];
            assert!(ShutdownCoordinator::default().execute(&mut steps));
        }
        assert_eq!(order, vec!["first"]);
    }

    #[test]
    fn coordinator_reports_failures() {
        let coord = ShutdownCoordinator::default();
        let mut good = || true;
        let mut bad = || false;
        let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> =
            vec![("good", &mut good), ("bad", &mut bad)];
        assert!(!coord.execute(&mut steps));
    }

    #[test]
    fn coordinator_fails_when_last_step_overruns() {
        let coord = ShutdownCoordinator::new(Duration::from_millis(10));
        let mut slow = || {
            std::thread::sleep(Duration::from_millis(100));
            true
        };
        let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> = vec![("slow", &mut slow)];
        assert!(!coord.execute(&mut steps));
    }

    #[test]
    fn coordinator_abandons_steps_after_overrun() {
        let coord = ShutdownCoordinator::new(Duration::from_millis(10));
        let mut slow = || {
            std::thread::sleep(Duration::from_millis(50));
            true
        };
        let mut never_ran = true;
        let mut later = || {
            never_ran = false;
            true
        };
        {
            let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> =
                vec![("slow", &mut slow), ("later", &mut later)];
            assert!(!coord.execute(&mut steps));
        }
        assert!(never_ran);
    }

    #[test]
    fn coordinator_succeeds_within_deadline() {
        let coord = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut quick = || true;
        let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> = vec![("quick", &mut quick)];
        assert!(coord.execute(&mut steps));
    }
}
