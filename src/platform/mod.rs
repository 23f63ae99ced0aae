//! Platform abstraction layer: the operating-system probes the ledger depends on.

pub mod pal;
