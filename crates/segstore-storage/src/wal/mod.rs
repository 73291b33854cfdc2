//! Write-ahead logs for the ingestion path

mod durable;
mod redo;
mod segment_log;

pub use durable::{CheckpointRange, DurableLog, RedoAction};
pub use redo::{RECORD_SIZE, RedoLog, RedoOptions, VALUE_FIXED_LENGTH};
pub use segment_log::{SegmentLog, SegmentLogOptions};
