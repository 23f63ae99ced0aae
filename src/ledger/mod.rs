//! Reservation bookkeeping: mount resolution, per-volume ledgers and the
//! registry that ties them together.

pub mod registry;
pub mod resolver;
pub mod volume;
