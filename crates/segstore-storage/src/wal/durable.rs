//! Per-index durable log
//!
//! Pairs the segmented append log that ingestion writes through with the
//! redo log that records how far each consumer of that log has got.

use bytes::Bytes;
use segstore_common::config::WalConfig;
use segstore_common::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use super::redo::{RedoLog, RedoOptions};
use super::segment_log::{SegmentLog, SegmentLogOptions};

/// Consumer of the segmented log whose progress is checkpointed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum RedoAction {
    Read = 1,
    Write = 2,
    Truncate = 3,
}

impl RedoAction {
    pub const ALL: [RedoAction; 3] = [RedoAction::Read, RedoAction::Write, RedoAction::Truncate];

    /// Redo log key the checkpoint is stored under
    pub fn key(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for RedoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedoAction::Read => write!(f, "read"),
            RedoAction::Write => write!(f, "write"),
            RedoAction::Truncate => write!(f, "truncate"),
        }
    }
}

/// Inclusive range of log indexes a consumer has processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRange {
    pub min: u64,
    pub max: u64,
}

impl fmt::Display for CheckpointRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.min, self.max)
    }
}

impl FromStr for CheckpointRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (min, max) = s
            .split_once(':')
            .ok_or_else(|| format!("expected min:max, got {:?}", s))?;
        let min = min
            .parse()
            .map_err(|e| format!("invalid min in {:?}: {}", s, e))?;
        let max = max
            .parse()
            .map_err(|e| format!("invalid max in {:?}: {}", s, e))?;
        Ok(Self { min, max })
    }
}

/// Segmented log plus redo log for one index
pub struct DurableLog {
    name: String,
    dir: PathBuf,
    log: SegmentLog,
    redo: RedoLog,
}

impl DurableLog {
    /// Open `<data_root>/<name>/wal` and `<data_root>/<name>/redo`
    pub fn open(data_root: impl AsRef<Path>, name: &str, config: &WalConfig) -> Result<Self> {
        let dir = data_root.as_ref().join(name);
        let log = SegmentLog::open(dir.join("wal"), SegmentLogOptions::from(config))?;
        let redo = RedoLog::open(
            dir.join("redo"),
            RedoOptions {
                no_sync: config.redo_no_sync,
            },
        )?;

        info!(
            "Opened durable log '{}' (entries {}..={}, {} redo keys)",
            name,
            log.first_index(),
            log.last_index(),
            redo.len()
        );
        Ok(Self {
            name: name.to_string(),
            dir,
            log,
            redo,
        })
    }

    /// Open the logs of an index that must already exist.
    ///
    /// Fails with `IndexNotFound` instead of creating `<data_root>/<name>`.
    pub fn open_existing(
        data_root: impl AsRef<Path>,
        name: &str,
        config: &WalConfig,
    ) -> Result<Self> {
        let dir = data_root.as_ref().join(name);
        if !dir.join("wal").is_dir() {
            return Err(Error::IndexNotFound {
                index: name.to_string(),
            });
        }
        Self::open(data_root, name, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> u64 {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn first_index(&self) -> u64 {
        self.log.first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    /// Append an entry to the segmented log and return its index
    pub fn write(&self, entry: &[u8]) -> Result<u64> {
        self.log.write(entry)
    }

    pub fn read(&self, index: u64) -> Result<Bytes> {
        self.log.read(index)
    }

    pub fn truncate_front(&self, index: u64) -> Result<()> {
        self.log.truncate_front(index)
    }

    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Close both logs, reporting the first failure
    pub fn close(&self) -> Result<()> {
        let log = self.log.close();
        let redo = self.redo.close();
        log.and(redo)
    }

    pub fn redo(&self) -> &RedoLog {
        &self.redo
    }

    /// Record the range `action` has processed
    pub fn write_checkpoint(&self, action: RedoAction, range: CheckpointRange) -> Result<()> {
        self.redo.write(action.key(), range.to_string().as_bytes())
    }

    /// Last range recorded for `action`, if any
    pub fn checkpoint(&self, action: RedoAction) -> Result<Option<CheckpointRange>> {
        let value = match self.redo.read_ref(action.key()) {
            Ok(value) => value,
            Err(Error::KeyNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let text = std::str::from_utf8(&value).map_err(|e| {
            Error::Corrupted(format!("{} checkpoint of '{}': {}", action, self.name, e))
        })?;
        text.parse()
            .map(Some)
            .map_err(|e| Error::Corrupted(format!("{} checkpoint of '{}': {}", action, self.name, e)))
    }
}
