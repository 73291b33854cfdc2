//! Local segment cache
//!
//! Segment files downloaded from (or persisted to) the remote backend are
//! kept on local disk and served through read-only memory maps. The
//! [`CacheManager`] owns the registry and keeps disk usage under budget with
//! a periodic LRU eviction pass; each [`CachedFile`] tracks the leases held
//! on it so an in-use file is never deleted.

mod file;
mod manager;

pub use file::{CachedFile, SegmentData, WriteLease};
pub use manager::{CacheManager, CacheStats, ReconcileReport};

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical clock for LRU ordering
#[derive(Debug, Default)]
pub(crate) struct Clock(AtomicU64);

impl Clock {
    /// Advance the clock and return the new value
    pub(crate) fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
