//! Segstore Storage Engine - Tiered segment storage
//!
//! This crate implements the storage tiers of a search index:
//! - Local segment cache (size-bounded, LRU eviction, leased mmap reads)
//! - Remote object store fronted by the cache
//! - Segmented write-ahead log plus a keyed redo log

pub mod cache;
pub mod objstore;
pub mod wal;

// Re-exports
pub use cache::{CacheManager, CacheStats, CachedFile, ReconcileReport, SegmentData, WriteLease};
pub use objstore::{
    LocalBackend, MemoryBackend, ObjectInfo, ObjectStore, RemoteBackend, SegmentWriter, connect,
};
#[cfg(feature = "s3")]
pub use objstore::S3Backend;
pub use wal::{
    CheckpointRange, DurableLog, RECORD_SIZE, RedoAction, RedoLog, RedoOptions, SegmentLog,
    SegmentLogOptions, VALUE_FIXED_LENGTH,
};
