//! One locally cached segment file and the leases handed out on it
//!
//! A lease pins the entry: while any [`SegmentData`] or [`WriteLease`] is
//! alive the reference count is non-zero and the cache will neither evict
//! nor remove the file. Eviction retires an entry by swapping its count
//! from zero to [`RETIRED`]; a retired entry can never be leased again.

use memmap2::Mmap;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use segstore_common::{Error, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::Clock;

/// Reference count value of an entry that has been evicted or removed
const RETIRED: usize = usize::MAX;

/// A locally cached segment file
#[derive(Debug)]
pub struct CachedFile {
    path: PathBuf,
    /// Outstanding leases, or `RETIRED`
    refs: AtomicUsize,
    /// Logical access time for LRU ordering
    last_access: AtomicU64,
    /// Size recorded by the last `update_size`
    size: AtomicU64,
    clock: Arc<Clock>,
}

impl CachedFile {
    pub(crate) fn new(path: PathBuf, clock: Arc<Clock>) -> Self {
        let now = clock.tick();
        Self {
            path,
            refs: AtomicUsize::new(0),
            last_access: AtomicU64::new(now),
            size: AtomicU64::new(0),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size recorded by the last `update_size`
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Logical time of the most recent lease
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Number of outstanding leases
    pub fn ref_count(&self) -> usize {
        match self.refs.load(Ordering::Acquire) {
            RETIRED => 0,
            n => n,
        }
    }

    /// Whether the entry has been evicted or removed
    pub fn is_retired(&self) -> bool {
        self.refs.load(Ordering::Acquire) == RETIRED
    }

    /// Open the file read-write for populating it.
    ///
    /// Takes an exclusive advisory lock without waiting; if another writer
    /// or a reader holds a lock on the file this fails with `LockHeld`.
    pub fn get_writer(self: &Arc<Self>) -> Result<WriteLease> {
        let lease = self.acquire()?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                Error::Storage(format!("failed to open {}: {}", self.path.display(), e))
            })?;
        let file = self.lock_file(file, FlockArg::LockExclusiveNonblock)?;

        Ok(WriteLease { file, lease })
    }

    /// Stat the backing file and record its size
    pub fn update_size(&self) -> Result<u64> {
        let len = std::fs::metadata(&self.path)
            .map_err(|e| Error::Storage(format!("failed to stat {}: {}", self.path.display(), e)))?
            .len();
        self.size.store(len, Ordering::Relaxed);
        Ok(len)
    }

    /// Map the file read-only under a shared advisory lock
    pub(crate) fn load_read_only(self: &Arc<Self>) -> Result<SegmentData> {
        let lease = self.acquire()?;

        let file = File::open(&self.path).map_err(|e| {
            Error::Storage(format!("failed to open {}: {}", self.path.display(), e))
        })?;
        let file = self.lock_file(file, FlockArg::LockSharedNonblock)?;

        let len = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to stat {}: {}", self.path.display(), e)))?
            .len();
        let map = if len == 0 {
            None
        } else {
            // SAFETY: the shared lock keeps cooperating writers out for the
            // lifetime of the map, and the map is dropped before the lock.
            #[allow(unsafe_code)]
            let map = unsafe { Mmap::map(&*file) }
                .map_err(|e| Error::Storage(format!("failed to map {}: {}", self.path.display(), e)))?;
            Some(map)
        };

        Ok(SegmentData {
            map,
            _file: file,
            lease,
        })
    }

    /// Move the entry to the retired state if no lease is outstanding
    pub(crate) fn try_retire(&self) -> bool {
        self.refs
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo `try_retire` when the file turned out to be locked elsewhere
    pub(crate) fn unretire(&self) {
        let _ = self
            .refs
            .compare_exchange(RETIRED, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn touch(&self) {
        self.last_access.store(self.clock.tick(), Ordering::Relaxed);
    }

    fn acquire(self: &Arc<Self>) -> Result<LeaseGuard> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != RETIRED).then(|| n + 1)
            })
            .map_err(|_| Error::Evicted {
                path: self.path.clone(),
            })?;
        self.touch();
        Ok(LeaseGuard {
            file: Arc::clone(self),
        })
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn lock_file(&self, file: File, arg: FlockArg) -> Result<Flock<File>> {
        Flock::lock(file, arg).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                Error::LockHeld {
                    path: self.path.clone(),
                }
            } else {
                Error::Storage(format!("failed to lock {}: {}", self.path.display(), errno))
            }
        })
    }
}

/// Exclusive advisory lock on `path` taken before deleting it.
///
/// Readers and writers in other processes hold `flock`s on the files they
/// use, so this fails with `LockHeld` while any of them is active. Returns
/// `None` if the file does not exist.
pub(crate) fn lock_for_delete(path: &Path) -> Result<Option<Flock<File>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Storage(format!(
                "failed to open {}: {}",
                path.display(),
                e
            )));
        }
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(lock)),
        Err((_, Errno::EWOULDBLOCK)) => Err(Error::LockHeld {
            path: path.to_path_buf(),
        }),
        Err((_, errno)) => Err(Error::Storage(format!(
            "failed to lock {}: {}",
            path.display(),
            errno
        ))),
    }
}

/// Holds one reference on a cached file until dropped
#[derive(Debug)]
struct LeaseGuard {
    file: Arc<CachedFile>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.file.release();
    }
}

/// Read-only mapped view of a cached segment.
///
/// Dropping it unmaps the file, releases the shared lock and closes the
/// descriptor, then gives back the lease, in that order.
pub struct SegmentData {
    map: Option<Mmap>,
    _file: Flock<File>,
    lease: LeaseGuard,
}

impl SegmentData {
    pub fn path(&self) -> &Path {
        self.lease.file.path()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

impl Deref for SegmentData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for SegmentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentData")
            .field("path", &self.path())
            .field("len", &self.len())
            .finish()
    }
}

impl AsRef<[u8]> for SegmentData {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Exclusive write handle on a cached file.
///
/// Dropping it releases the advisory lock and the lease.
pub struct WriteLease {
    file: Flock<File>,
    lease: LeaseGuard,
}

impl WriteLease {
    pub fn path(&self) -> &Path {
        self.lease.file.path()
    }

    /// Discard any previous content
    pub fn reset(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| Error::Storage(format!("failed to truncate {}: {}", self.path().display(), e)))
    }

    /// Flush file contents to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::Storage(format!("failed to sync {}: {}", self.path().display(), e)))
    }

    /// Release the lock and the lease
    pub fn close(self) {}
}

impl fmt::Debug for WriteLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLease").field("path", &self.path()).finish()
    }
}

impl Write for WriteLease {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
