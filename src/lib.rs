#![forbid(unsafe_code)]

//! vreserve: a local disk-space reservation broker.
//!
//! Processes that are about to write large amounts of data ask the service to
//! reserve space on the volume that will hold the data, and release it when the
//! work is done. Each mounted volume gets its own ledger; admission compares the
//! requested amount against the volume's live free space minus what is already
//! promised to other paths.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use vreserve::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use vreserve::client::volume_client::VolumeClient;
//! use vreserve::ledger::registry::LedgerRegistry;
//! ```

pub mod prelude;

pub mod client;
pub mod core;
pub mod daemon;
pub mod ledger;
pub mod logger;
pub mod platform;
