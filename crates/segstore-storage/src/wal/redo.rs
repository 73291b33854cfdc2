//! Keyed redo log with fixed-size values
//!
//! Every record occupies the same number of bytes, so a key's value can be
//! overwritten in place. The whole file is mirrored in memory together with
//! a key to offset index, and each write flushes the full buffer back to the
//! file from offset zero.
//!
//! Record format:
//! ```text
//! +-----+--------+---------------+
//! | Key | Length | Value (+pad)  |
//! | 8B  | 8B     | 64B           |
//! +-----+--------+---------------+
//! ```
//! Bytes past `Length` in the value region are stale and never read.

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use segstore_common::{Error, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Largest value a record can hold
pub const VALUE_FIXED_LENGTH: usize = 64;

const HEADER_SIZE: usize = 16;

/// Bytes per record on disk
pub const RECORD_SIZE: usize = HEADER_SIZE + VALUE_FIXED_LENGTH;

/// Redo log options
#[derive(Debug, Clone, Default)]
pub struct RedoOptions {
    /// Skip fsync after each write
    pub no_sync: bool,
}

struct RedoState {
    /// Key to record offset
    index: HashMap<u64, usize>,
    data: Vec<u8>,
    file: Option<File>,
}

impl RedoState {
    fn value(&self, key: u64) -> Option<&[u8]> {
        let offset = *self.index.get(&key)?;
        let len = read_u64(&self.data, offset + 8) as usize;
        let start = offset + HEADER_SIZE;
        Some(&self.data[start..start + len])
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Closed)
    }
}

/// Fixed-record keyed log
pub struct RedoLog {
    path: PathBuf,
    options: RedoOptions,
    state: RwLock<RedoState>,
}

impl RedoLog {
    /// Open or create the log at `path` and index its records
    pub fn open(path: impl AsRef<Path>, options: RedoOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("failed to create redo dir {:?}: {}", parent, e))
            })?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open redo log {:?}: {}", path, e)))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| Error::Storage(format!("failed to read redo log {:?}: {}", path, e)))?;

        let whole = data.len() - data.len() % RECORD_SIZE;
        if whole < data.len() {
            warn!(
                "Discarding {} bytes of partial record at the end of {:?}",
                data.len() - whole,
                path
            );
            file.set_len(whole as u64).map_err(|e| {
                Error::Storage(format!("failed to repair redo log {:?}: {}", path, e))
            })?;
            data.truncate(whole);
        }

        let mut index = HashMap::with_capacity(data.len() / RECORD_SIZE);
        for offset in (0..data.len()).step_by(RECORD_SIZE) {
            let key = read_u64(&data, offset);
            let len = read_u64(&data, offset + 8);
            if len > VALUE_FIXED_LENGTH as u64 {
                return Err(Error::Corrupted(format!(
                    "redo record for key {} at offset {} has length {}",
                    key, offset, len
                )));
            }
            index.insert(key, offset);
        }

        debug!("Opened redo log {:?} with {} keys", path, index.len());
        Ok(Self {
            path,
            options,
            state: RwLock::new(RedoState {
                index,
                data,
                file: Some(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn write(&self, key: u64, value: &[u8]) -> Result<()> {
        if value.len() > VALUE_FIXED_LENGTH {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max: VALUE_FIXED_LENGTH,
            });
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.file.is_none() {
            return Err(Error::Closed);
        }

        let offset = match state.index.get(&key) {
            Some(&offset) => offset,
            None => {
                let offset = state.data.len();
                state.data.resize(offset + RECORD_SIZE, 0);
                state.data[offset..offset + 8].copy_from_slice(&key.to_le_bytes());
                state.index.insert(key, offset);
                offset
            }
        };
        state.data[offset + 8..offset + HEADER_SIZE]
            .copy_from_slice(&(value.len() as u64).to_le_bytes());
        let start = offset + HEADER_SIZE;
        state.data[start..start + value.len()].copy_from_slice(value);

        let file = state.file()?;
        file.write_all_at(&state.data, 0)
            .map_err(|e| Error::Storage(format!("redo write failed: {}", e)))?;
        if !self.options.no_sync {
            file.sync_data()
                .map_err(|e| Error::Storage(format!("redo sync failed: {}", e)))?;
        }
        Ok(())
    }

    /// Copy of the value stored under `key`
    pub fn read(&self, key: u64) -> Result<Vec<u8>> {
        let state = self.state.read();
        state.file()?;
        state
            .value(key)
            .map(<[u8]>::to_vec)
            .ok_or(Error::KeyNotFound { key })
    }

    /// The value stored under `key`, borrowed from the in-memory buffer.
    ///
    /// Writers are blocked while the guard is held.
    pub fn read_ref(&self, key: u64) -> Result<MappedRwLockReadGuard<'_, [u8]>> {
        let state = self.state.read();
        state.file()?;
        RwLockReadGuard::try_map(state, |s| s.value(key)).map_err(|_| Error::KeyNotFound { key })
    }

    /// All (key, value) pairs in record order
    pub fn entries(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let state = self.state.read();
        state.file()?;
        let mut offsets: Vec<_> = state.index.iter().map(|(k, o)| (*o, *k)).collect();
        offsets.sort_unstable();
        Ok(offsets
            .into_iter()
            .filter_map(|(_, key)| state.value(key).map(|v| (key, v.to_vec())))
            .collect())
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sync and close the file, dropping the in-memory state
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        let file = state.file.take().ok_or(Error::Closed)?;
        state.index.clear();
        state.data = Vec::new();
        file.sync_all()
            .map_err(|e| Error::Storage(format!("redo sync failed: {}", e)))
    }
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::io::Write;
    use tempfile::tempdir;

    fn open(path: &Path) -> RedoLog {
        RedoLog::open(path, RedoOptions::default()).unwrap()
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let dir = tempdir().unwrap();
        let log = open(&dir.path().join("redo"));

        log.write(7, b"a").unwrap();
        log.write(7, b"bb").unwrap();
        assert_eq!(log.read(7).unwrap(), b"bb");
        assert_eq!(log.len(), 1);
        assert_eq!(
            std::fs::metadata(log.path()).unwrap().len(),
            RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_value_size_boundary() {
        let dir = tempdir().unwrap();
        let log = open(&dir.path().join("redo"));

        log.write(1, &[0xAB; 64]).unwrap();
        let err = log.write(2, &[0xAB; 65]).unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge { len: 65, max: 64 }));
        assert!(matches!(log.read(2), Err(Error::KeyNotFound { key: 2 })));
    }

    #[test]
    fn test_record_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo");
        let log = open(&path);
        log.write(0x0102, b"xyz").unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), RECORD_SIZE);
        assert_eq!(&raw[..8], &0x0102u64.to_le_bytes());
        assert_eq!(&raw[8..16], &3u64.to_le_bytes());
        assert_eq!(&raw[16..19], b"xyz");
    }

    #[test]
    fn test_reopen_keeps_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("redo");
        {
            let log = open(&path);
            log.write(1, b"one").unwrap();
            log.write(2, b"two").unwrap();
            log.write(1, b"uno").unwrap();
            log.close().unwrap();
            assert!(matches!(log.read(1), Err(Error::Closed)));
        }

        let log = open(&path);
        assert_eq!(log.read(1).unwrap(), b"uno");
        assert_eq!(&*log.read_ref(2).unwrap(), b"two");
        assert_eq!(
            log.entries().unwrap(),
            vec![(1, b"uno".to_vec()), (2, b"two".to_vec())]
        );
    }

    #[test]
    fn test_partial_record_dropped_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo");
        {
            let log = open(&path);
            log.write(5, b"kept").unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1u8; 30]).unwrap();
        drop(file);

        let log = open(&path);
        assert_eq!(log.len(), 1);
        assert_eq!(log.read(5).unwrap(), b"kept");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), RECORD_SIZE as u64);
    }

    #[test]
    fn test_bad_length_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo");
        let mut record = vec![0u8; RECORD_SIZE];
        record[8..16].copy_from_slice(&100u64.to_le_bytes());
        std::fs::write(&path, record).unwrap();

        let err = RedoLog::open(&path, RedoOptions::default()).err().unwrap();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn test_random_values_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo");
        let log = RedoLog::open(&path, RedoOptions { no_sync: true }).unwrap();
        let mut rng = rand::thread_rng();

        let mut expected = HashMap::new();
        for _ in 0..200 {
            let key = rng.gen_range(0..32u64);
            let len = rng.gen_range(0..=VALUE_FIXED_LENGTH);
            let value: Vec<u8> = (0..len).map(|_| rng.r#gen::<u8>()).collect();
            log.write(key, &value).unwrap();
            expected.insert(key, value);
        }

        for (key, value) in &expected {
            assert_eq!(&log.read(*key).unwrap(), value);
        }
        drop(log);

        let log = open(&path);
        assert_eq!(log.len(), expected.len());
        for (key, value) in &expected {
            assert_eq!(&*log.read_ref(*key).unwrap(), value.as_slice());
        }
    }
}
