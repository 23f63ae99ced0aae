//! Daemon subsystem: HTTP transport, wire protocol, lifecycle and signal handling.

#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod protocol;
pub mod server;
#[cfg(feature = "daemon")]
pub mod signals;
