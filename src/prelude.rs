//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use vreserve::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, VrError};

// Platform
pub use crate::platform::pal::{MockPlatform, Platform, detect_platform};

// Ledger
pub use crate::ledger::registry::LedgerRegistry;
pub use crate::ledger::resolver::{MountpointResolver, Resolution};
pub use crate::ledger::volume::{Admission, VolumeLedger};

// Service
pub use crate::client::volume_client::VolumeClient;
pub use crate::daemon::protocol::VolumeResponse;
pub use crate::daemon::server::{ServiceHandle, VolumeService};
#[cfg(feature = "daemon")]
pub use crate::daemon::loop_main::{VolumeDaemon, run_daemon};
