//! Segmented append log
//!
//! Entries get consecutive indexes starting at 1. The log is split into
//! segment files named after the index of their first entry; the last
//! segment (the tail) takes appends and rolls over once it reaches the
//! configured size. Sealed segments are read back whole and kept in a
//! small LRU.
//!
//! Record format:
//! ```text
//! +--------+------+--------+
//! | Length | Data | CRC32C |
//! | 4B     | var  | 4B     |
//! +--------+------+--------+
//! ```
//! The checksum covers the length and the data.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use segstore_common::config::WalConfig;
use segstore_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Length prefix plus checksum
const RECORD_OVERHEAD: usize = 8;

/// Segment file names are the zero-padded first index
const SEGMENT_NAME_LEN: usize = 20;

const TEMP_SUFFIX: &str = ".tmp";

/// Segmented log options
#[derive(Debug, Clone)]
pub struct SegmentLogOptions {
    /// Size at which the tail segment is sealed
    pub segment_size: u64,
    /// Sealed segments kept in memory
    pub segment_cache_size: usize,
    /// Skip fsync after each append
    pub no_sync: bool,
}

impl Default for SegmentLogOptions {
    fn default() -> Self {
        Self::from(&WalConfig::default())
    }
}

impl From<&WalConfig> for SegmentLogOptions {
    fn from(config: &WalConfig) -> Self {
        Self {
            segment_size: config.segment_size,
            segment_cache_size: config.segment_cache_size,
            no_sync: config.no_sync,
        }
    }
}

/// A fully loaded sealed segment
struct LoadedSegment {
    first_index: u64,
    data: Bytes,
    /// (offset, len) of each entry's data
    spans: Vec<(usize, usize)>,
}

impl LoadedSegment {
    fn entry(&self, index: u64) -> Option<Bytes> {
        let pos = usize::try_from(index.checked_sub(self.first_index)?).ok()?;
        let (offset, len) = *self.spans.get(pos)?;
        Some(self.data.slice(offset..offset + len))
    }
}

/// The segment taking appends, mirrored in memory
struct Tail {
    first_index: u64,
    path: PathBuf,
    file: File,
    data: Vec<u8>,
    spans: Vec<(usize, usize)>,
}

struct LogState {
    /// Sealed segments as (first index, path), ascending
    sealed: Vec<(u64, PathBuf)>,
    tail: Tail,
    first_index: u64,
    cache: LruCache<u64, Arc<LoadedSegment>>,
    closed: bool,
}

impl LogState {
    /// Index of the newest entry, `first_index - 1` when empty
    fn last(&self) -> u64 {
        self.tail.first_index + self.tail.spans.len() as u64 - 1
    }

    fn len(&self) -> u64 {
        self.last() + 1 - self.first_index
    }
}

/// Segmented, sequentially indexed append log
pub struct SegmentLog {
    dir: PathBuf,
    options: SegmentLogOptions,
    state: Mutex<LogState>,
}

impl SegmentLog {
    /// Open the log in `dir`, creating it if absent.
    ///
    /// A partially written record at the end of the tail segment is cut off.
    pub fn open(dir: impl AsRef<Path>, options: SegmentLogOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("failed to create log dir {:?}: {}", dir, e)))?;

        let mut firsts = list_segments(&dir)?;
        firsts.sort_unstable();

        let tail_first = firsts.pop().unwrap_or(1);
        let sealed: Vec<_> = firsts
            .iter()
            .map(|&first| (first, segment_path(&dir, first)))
            .collect();
        let first_index = sealed.first().map_or(tail_first, |(first, _)| *first);
        let tail = open_tail(&dir, tail_first)?;

        let capacity =
            NonZeroUsize::new(options.segment_cache_size).unwrap_or(NonZeroUsize::MIN);
        let state = LogState {
            sealed,
            tail,
            first_index,
            cache: LruCache::new(capacity),
            closed: false,
        };

        info!(
            "Opened segment log at {:?} ({} segments, entries {}..={})",
            dir,
            state.sealed.len() + 1,
            state.first_index,
            state.last()
        );

        Ok(Self {
            dir,
            options,
            state: Mutex::new(state),
        })
    }

    /// Directory holding the segment files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an entry and return its index
    pub fn write(&self, data: &[u8]) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(Error::Closed);
        }
        if u32::try_from(data.len()).is_err() {
            return Err(Error::ValueTooLarge {
                len: data.len(),
                max: u32::MAX as usize,
            });
        }

        let mut record = Vec::with_capacity(data.len() + RECORD_OVERHEAD);
        encode_record(data, &mut record);

        let tail_size = state.tail.data.len() as u64;
        if tail_size > 0 && tail_size + record.len() as u64 > self.options.segment_size {
            self.rotate(state)?;
        }

        // Records go at the end of the valid data, so whatever a failed
        // append left behind is cut off or overwritten
        let tail = &mut state.tail;
        let offset = tail.data.len();
        if let Err(e) = append_record(&tail.file, offset as u64, &record, self.options.no_sync) {
            if let Err(undo) = tail.file.set_len(offset as u64) {
                warn!(
                    "Failed to roll back partial record in {:?}: {}",
                    tail.path, undo
                );
            }
            return Err(e);
        }

        tail.data.extend_from_slice(&record);
        tail.spans.push((offset + 4, data.len()));
        Ok(state.last())
    }

    /// Read the entry at `index`
    pub fn read(&self, index: u64) -> Result<Bytes> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(Error::Closed);
        }
        if index < state.first_index || index > state.last() {
            return Err(Error::EntryNotFound { index });
        }

        if index >= state.tail.first_index {
            let pos = (index - state.tail.first_index) as usize;
            let (offset, len) = state.tail.spans[pos];
            return Ok(Bytes::copy_from_slice(&state.tail.data[offset..offset + len]));
        }

        let pos = state.sealed.partition_point(|(first, _)| *first <= index) - 1;
        let segment = load_segment(state, pos)?;
        segment.entry(index).ok_or(Error::EntryNotFound { index })
    }

    /// Index of the oldest entry, 0 when the log is empty
    pub fn first_index(&self) -> u64 {
        let state = self.state.lock();
        if state.len() == 0 { 0 } else { state.first_index }
    }

    /// Index of the newest entry, 0 when the log is empty
    pub fn last_index(&self) -> u64 {
        let state = self.state.lock();
        if state.len() == 0 { 0 } else { state.last() }
    }

    /// Number of live entries
    pub fn len(&self) -> u64 {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry before `index`, which becomes the first entry.
    ///
    /// The segment containing `index` is rewritten to start at it; the new
    /// file is in place before any older file is deleted.
    pub fn truncate_front(&self, index: u64) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(Error::Closed);
        }
        if state.len() == 0 || index < state.first_index || index > state.last() {
            return Err(Error::EntryNotFound { index });
        }
        if index == state.first_index {
            return Ok(());
        }

        if index >= state.tail.first_index {
            if index > state.tail.first_index {
                let skip = (index - state.tail.first_index) as usize;
                let mut data = Vec::new();
                for &(offset, len) in &state.tail.spans[skip..] {
                    encode_record(&state.tail.data[offset..offset + len], &mut data);
                }
                write_segment_file(&self.dir, index, &data)?;
                let old = std::mem::replace(&mut state.tail, open_tail(&self.dir, index)?);
                remove_segment_file(&old.path);
            }
            for (_, path) in state.sealed.drain(..) {
                remove_segment_file(&path);
            }
        } else {
            let pos = state.sealed.partition_point(|(first, _)| *first <= index) - 1;
            let seg_first = state.sealed[pos].0;
            if index > seg_first {
                let segment = load_segment(state, pos)?;
                let skip = (index - seg_first) as usize;
                let mut data = Vec::new();
                for &(offset, len) in &segment.spans[skip..] {
                    encode_record(&segment.data[offset..offset + len], &mut data);
                }
                let path = write_segment_file(&self.dir, index, &data)?;
                let old = std::mem::replace(&mut state.sealed[pos], (index, path));
                remove_segment_file(&old.1);
            }
            for (_, path) in state.sealed.drain(..pos) {
                remove_segment_file(&path);
            }
        }

        state.cache.clear();
        state.first_index = index;
        debug!("Truncated segment log {:?} before {}", self.dir, index);
        Ok(())
    }

    /// Flush the tail segment to stable storage
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state
            .tail
            .file
            .sync_all()
            .map_err(|e| Error::Storage(format!("log sync failed: {}", e)))
    }

    /// Sync and close; further calls fail with `Closed`
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state
            .tail
            .file
            .sync_all()
            .map_err(|e| Error::Storage(format!("log sync failed: {}", e)))?;
        state.cache.clear();
        state.closed = true;
        Ok(())
    }

    /// Seal the tail and start a new one after the last entry
    fn rotate(&self, state: &mut LogState) -> Result<()> {
        let tail = &state.tail;
        tail.file
            .set_len(tail.data.len() as u64)
            .and_then(|()| tail.file.sync_all())
            .map_err(|e| Error::Storage(format!("failed to seal segment {:?}: {}", tail.path, e)))?;

        let next = state.last() + 1;
        let old = std::mem::replace(&mut state.tail, open_tail(&self.dir, next)?);
        debug!(
            "Sealed log segment {:?} ({} entries)",
            old.path,
            old.spans.len()
        );

        state.sealed.push((old.first_index, old.path));
        state.cache.put(
            old.first_index,
            Arc::new(LoadedSegment {
                first_index: old.first_index,
                data: Bytes::from(old.data),
                spans: old.spans,
            }),
        );
        Ok(())
    }
}

fn segment_path(dir: &Path, first_index: u64) -> PathBuf {
    dir.join(format!("{:020}", first_index))
}

/// First indexes of the segment files in `dir`; stale temp files are removed
fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Storage(format!("failed to read log dir {:?}: {}", dir, e)))?;

    let mut firsts = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::Storage(format!("failed to read log dir {:?}: {}", dir, e)))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(TEMP_SUFFIX) {
            remove_segment_file(&entry.path());
            continue;
        }
        if name.len() != SEGMENT_NAME_LEN {
            continue;
        }
        if let Ok(first) = name.parse::<u64>() {
            firsts.push(first);
        }
    }
    Ok(firsts)
}

/// Load the tail segment into memory and open it for appending
fn open_tail(dir: &Path, first_index: u64) -> Result<Tail> {
    let path = segment_path(dir, first_index);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| Error::Storage(format!("failed to open segment {:?}: {}", path, e)))?;

    let mut data = std::fs::read(&path)
        .map_err(|e| Error::Storage(format!("failed to read segment {:?}: {}", path, e)))?;
    let (spans, valid) = scan_records(&data);
    if valid < data.len() {
        warn!(
            "Discarding {} bytes of partial records at the end of {:?}",
            data.len() - valid,
            path
        );
        file.set_len(valid as u64)
            .map_err(|e| Error::Storage(format!("failed to repair segment {:?}: {}", path, e)))?;
        data.truncate(valid);
    }

    Ok(Tail {
        first_index,
        path,
        file,
        data,
        spans,
    })
}

fn load_segment(state: &mut LogState, pos: usize) -> Result<Arc<LoadedSegment>> {
    let (first_index, path) = &state.sealed[pos];
    if let Some(segment) = state.cache.get(first_index) {
        return Ok(Arc::clone(segment));
    }

    let data = std::fs::read(path)
        .map_err(|e| Error::Storage(format!("failed to read segment {:?}: {}", path, e)))?;
    let (spans, valid) = scan_records(&data);
    if valid != data.len() {
        return Err(Error::Corrupted(format!(
            "segment {:?} has an invalid record at offset {}",
            path, valid
        )));
    }

    let segment = Arc::new(LoadedSegment {
        first_index: *first_index,
        data: Bytes::from(data),
        spans,
    });
    state.cache.put(*first_index, Arc::clone(&segment));
    Ok(segment)
}

/// Write a complete segment file through a temp file and a rename
fn write_segment_file(dir: &Path, first_index: u64, data: &[u8]) -> Result<PathBuf> {
    let path = segment_path(dir, first_index);
    let temp = dir.join(format!("{:020}{}", first_index, TEMP_SUFFIX));

    let mut file = File::create(&temp)
        .map_err(|e| Error::Storage(format!("failed to create {:?}: {}", temp, e)))?;
    file.write_all(data)
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::Storage(format!("failed to write {:?}: {}", temp, e)))?;
    std::fs::rename(&temp, &path)
        .map_err(|e| Error::Storage(format!("failed to rename {:?}: {}", temp, e)))?;
    Ok(path)
}

fn remove_segment_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove log segment {:?}: {}", path, e);
    }
}

fn append_record(file: &File, offset: u64, record: &[u8], no_sync: bool) -> Result<()> {
    file.write_all_at(record, offset)
        .map_err(|e| Error::Storage(format!("log write failed: {}", e)))?;
    if !no_sync {
        file.sync_data()
            .map_err(|e| Error::Storage(format!("log sync failed: {}", e)))?;
    }
    Ok(())
}

fn encode_record(data: &[u8], buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    let crc = crc32c::crc32c(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}

/// Data spans of the valid records and the length of the valid prefix
fn scan_records(buf: &[u8]) -> (Vec<(usize, usize)>, usize) {
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos + RECORD_OVERHEAD <= buf.len() {
        let len = read_u32(buf, pos) as usize;
        let end = pos + 4 + len + 4;
        if end > buf.len() {
            break;
        }
        if crc32c::crc32c(&buf[pos..pos + 4 + len]) != read_u32(buf, pos + 4 + len) {
            break;
        }
        spans.push((pos + 4, len));
        pos = end;
    }
    (spans, pos)
}
