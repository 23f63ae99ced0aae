//! Per-volume reservation ledger.
//!
//! Admission and mutation happen under one lock together with the live
//! free-space probe, so two concurrent requests can never both be admitted
//! against the same free bytes.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::{Result, VrError};
use crate::platform::pal::Platform;

/// Successful admission details, returned for logging and reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub mount_point: String,
    pub bytes: u64,
    /// Amount previously reserved under the same path, now replaced.
    pub replaced: Option<u64>,
    /// Free space reported by the volume at admission time.
    pub free_bytes: u64,
    /// Sum of all reservations on this volume after admission.
    pub reserved_total: u64,
}

/// Ledger of outstanding reservations on one mounted volume.
pub struct VolumeLedger {
    mount_point: String,
    platform: Arc<dyn Platform>,
    reservations: Mutex<BTreeMap<String, u64>>,
}

impl std::fmt::Debug for VolumeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeLedger")
            .field("mount_point", &self.mount_point)
            .field("reservations", &*self.reservations.lock())
            .finish_non_exhaustive()
    }
}

impl VolumeLedger {
    #[must_use]
    pub fn new(mount_point: impl Into<String>, platform: Arc<dyn Platform>) -> Self {
        Self {
            mount_point: mount_point.into(),
            platform,
            reservations: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Reserve `bytes` for `path`, replacing any earlier reservation under
    /// the same path.
    ///
    /// Available space is the volume's live free space minus every other
    /// outstanding reservation; the path's own previous amount does not count
    /// against its replacement.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty path or zero bytes, `FsStats` when the
    /// free-space probe fails, `InsufficientSpace` when the request does not
    /// fit. The ledger is unchanged on every error.
    pub fn reserve(&self, path: &str, bytes: u64) -> Result<Admission> {
        if path.is_empty() {
            return Err(VrError::invalid_argument("path must not be empty"));
        }
        if bytes == 0 {
            return Err(VrError::invalid_argument("bytes must be greater than zero"));
        }

        let mut reservations = self.reservations.lock();
        let free_bytes = self.platform.free_bytes(Path::new(&self.mount_point))?;
        let replaced = reservations.get(path).copied();
        let committed = total(&reservations).saturating_sub(replaced.unwrap_or(0));
        let available = free_bytes.saturating_sub(committed);
        if bytes > available {
            return Err(VrError::InsufficientSpace {
                mount_point: self.mount_point.clone(),
                requested: bytes,
                available,
            });
        }

        reservations.insert(path.to_string(), bytes);
        Ok(Admission {
            mount_point: self.mount_point.clone(),
            bytes,
            replaced,
            free_bytes,
            reserved_total: committed.saturating_add(bytes),
        })
    }

    /// Drop the reservation for `path`. Returns the released amount, or
    /// `None` when nothing was reserved under that path.
    pub fn release(&self, path: &str) -> Result<Option<u64>> {
        if path.is_empty() {
            return Err(VrError::invalid_argument("path must not be empty"));
        }
        Ok(self.reservations.lock().remove(path))
    }

    /// Point-in-time copy of every reservation, ordered by path.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.reservations.lock().clone()
    }

    #[must_use]
    pub fn reserved_total(&self) -> u64 {
        total(&self.reservations.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reservations.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reservations.lock().is_empty()
    }
}

fn total(reservations: &BTreeMap<String, u64>) -> u64 {
    reservations
        .values()
        .fold(0_u64, |acc, bytes| acc.saturating_add(*bytes))
}
