//! Cache registry and background eviction

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use segstore_common::config::StorageConfig;
use segstore_common::{Error, Result, SegmentKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use super::Clock;
use super::file::{CachedFile, SegmentData, lock_for_delete};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Loads served from a registered entry
    pub hits: AtomicU64,
    /// Loads of an unregistered path
    pub misses: AtomicU64,
    /// Entries deleted by eviction passes
    pub evictions: AtomicU64,
    /// Entries registered
    pub insertions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tracked bytes when the pass started
    pub total_before: u64,
    /// Tracked bytes when the pass finished
    pub total_after: u64,
    /// Entries deleted
    pub evicted: usize,
}

/// Registry of locally cached segment files, shared by every object store.
///
/// Reads take the registry lock shared; registration, removal and eviction
/// take it exclusively. Entries are only deleted once they have been retired,
/// which fails while any lease is outstanding.
pub struct CacheManager {
    inner: Arc<CacheInner>,
    reconciler: Mutex<Option<Reconciler>>,
}

struct Reconciler {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

struct CacheInner {
    files: RwLock<HashMap<PathBuf, Arc<CachedFile>>>,
    root: PathBuf,
    max_size: u64,
    target_ratio: f64,
    clock: Arc<Clock>,
    stats: CacheStats,
}

impl CacheManager {
    /// Create an empty cache without starting the eviction task
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                files: RwLock::new(HashMap::new()),
                root: config.data_dir.clone(),
                max_size: config.max_cache_size,
                target_ratio: config.eviction_target_ratio,
                clock: Arc::new(Clock::default()),
                stats: CacheStats::default(),
            }),
            reconciler: Mutex::new(None),
        }
    }

    /// Create the cache, register the segment files already on disk and
    /// start the periodic eviction task
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let cache = Self::new(config);
        let count = cache.rebuild()?;
        info!(
            "Opened segment cache at {:?} ({} files, {} bytes)",
            config.data_dir,
            count,
            cache.total_size()
        );
        cache.start_reconciler(config.reconcile_interval());
        Ok(cache)
    }

    /// Data root this cache tracks
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.inner.files.read().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.files.read().is_empty()
    }

    /// Sum of the tracked sizes of all entries
    pub fn total_size(&self) -> u64 {
        self.inner.files.read().values().map(|f| f.size()).sum()
    }

    /// Size an eviction pass shrinks the cache to
    pub fn target_size(&self) -> u64 {
        self.inner.target_size()
    }

    /// Map a registered file read-only.
    ///
    /// # Panics
    ///
    /// Panics if `path` was never registered. Callers must go through the
    /// object store download path first; use [`try_load`](Self::try_load)
    /// for opportunistic reads.
    pub fn load(&self, path: &Path) -> Result<SegmentData> {
        let Some(file) = self.get_cache(path) else {
            panic!("load of unregistered cache path {}", path.display());
        };
        self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
        file.load_read_only()
    }

    /// Map a file read-only if it is registered, `NotCached` otherwise
    pub fn try_load(&self, path: &Path) -> Result<SegmentData> {
        match self.get_cache(path) {
            Some(file) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                file.load_read_only()
            }
            None => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::NotCached {
                    path: path.to_path_buf(),
                })
            }
        }
    }

    /// Registry membership check, no I/O
    pub fn exists(&self, path: &Path) -> bool {
        self.inner.files.read().contains_key(path)
    }

    /// Allocate an entry for `path` without registering it
    pub fn create_cache(&self, path: impl Into<PathBuf>) -> Arc<CachedFile> {
        Arc::new(CachedFile::new(path.into(), Arc::clone(&self.inner.clock)))
    }

    /// Register a populated entry, replacing any previous one for its path
    pub fn add_cache(&self, file: Arc<CachedFile>) {
        debug!(path = %file.path().display(), size = file.size(), "registering cache entry");
        self.inner
            .files
            .write()
            .insert(file.path().to_path_buf(), file);
        self.inner.stats.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_cache(&self, path: &Path) -> Option<Arc<CachedFile>> {
        self.inner.files.read().get(path).cloned()
    }

    /// Drop the entry for `path` and delete the file from local disk.
    ///
    /// Fails with `FileBusy` while a lease is held on the entry, and with
    /// `LockHeld` while another process holds a lock on the file; the entry
    /// and the file are then left untouched. An unregistered path only has
    /// its file deleted, if present.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let mut files = self.inner.files.write();
        let entry = files.get(path).cloned();
        if let Some(file) = &entry
            && !file.try_retire()
        {
            return Err(Error::FileBusy {
                path: path.to_path_buf(),
                refs: file.ref_count(),
            });
        }

        let _lock = match lock_for_delete(path) {
            Ok(lock) => lock,
            Err(e) => {
                if let Some(file) = &entry {
                    file.unretire();
                }
                return Err(e);
            }
        };
        files.remove(path);
        remove_file_if_exists(path)
    }

    /// Register every segment file under the data root.
    ///
    /// Files are registered oldest modification first so the access order
    /// starts out matching on-disk age. Already registered paths are skipped.
    pub fn rebuild(&self) -> Result<usize> {
        let mut found = Vec::new();
        if self.inner.root.is_dir() {
            scan_segment_files(&self.inner.root, &mut found)?;
        }
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut files = self.inner.files.write();
        let mut count = 0;
        for (path, size, _) in found {
            if files.contains_key(&path) {
                continue;
            }
            let file = self.create_cache(path.clone());
            file.set_size(size);
            files.insert(path, file);
            count += 1;
        }
        Ok(count)
    }

    /// Run one eviction pass now
    pub fn reconcile(&self) -> ReconcileReport {
        self.inner.reconcile()
    }

    /// Start the periodic eviction task; no-op if already running
    pub fn start_reconciler(&self, interval: Duration) {
        let mut slot = self.reconciler.lock();
        if slot.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::spawn(move || {
            info!("Cache eviction task started (interval {:?})", interval);
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        inner.reconcile();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Cache eviction task stopped");
        });

        *slot = Some(Reconciler { stop, handle });
    }

    /// Stop the eviction task, waiting for an in-flight pass to finish
    pub fn shutdown(&self) {
        if let Some(reconciler) = self.reconciler.lock().take() {
            let _ = reconciler.stop.send(());
            if reconciler.handle.join().is_err() {
                error!("Cache eviction task panicked");
            }
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CacheInner {
    fn target_size(&self) -> u64 {
        (self.max_size as f64 * self.target_ratio) as u64
    }

    fn reconcile(&self) -> ReconcileReport {
        let (total, candidates) = self.candidates();
        let target = self.target_size();

        if candidates.is_empty() {
            debug!("Eviction pass finished: no unused cache entries");
            return ReconcileReport {
                total_before: total,
                total_after: total,
                evicted: 0,
            };
        }
        if total < target {
            debug!("Eviction pass finished: {} bytes cached, target {}", total, target);
            return ReconcileReport {
                total_before: total,
                total_after: total,
                evicted: 0,
            };
        }

        let report = self.evict(candidates, target);
        if report.evicted > 0 {
            info!(
                "Evicted {} cache entries ({} -> {} bytes, target {})",
                report.evicted, report.total_before, report.total_after, target
            );
        }
        report
    }

    /// Tracked total and the idle entries, oldest access first
    fn candidates(&self) -> (u64, Vec<Arc<CachedFile>>) {
        let files = self.files.read();
        let total = files.values().map(|f| f.size()).sum();
        let mut idle: Vec<_> = files
            .values()
            .filter(|f| f.ref_count() == 0)
            .cloned()
            .collect();
        drop(files);

        idle.sort_by_key(|f| f.last_access());
        (total, idle)
    }

    /// Delete candidates until the total drops under `target`.
    ///
    /// Each candidate is re-validated under the exclusive lock: one that was
    /// replaced or leased since the candidate scan is skipped, and so is one
    /// whose file another process has locked.
    fn evict(&self, candidates: Vec<Arc<CachedFile>>, target: u64) -> ReconcileReport {
        let mut files = self.files.write();
        let total_before: u64 = files.values().map(|f| f.size()).sum();
        let mut total = total_before;
        let mut evicted = 0;

        for file in candidates {
            if total < target {
                break;
            }
            let current = files.get(file.path());
            if !current.is_some_and(|c| Arc::ptr_eq(c, &file)) {
                continue;
            }
            if !file.try_retire() {
                debug!(path = %file.path().display(), "skipping eviction of leased entry");
                continue;
            }
            let _lock = match lock_for_delete(file.path()) {
                Ok(lock) => lock,
                Err(e) => {
                    debug!(path = %file.path().display(), "skipping eviction: {}", e);
                    file.unretire();
                    continue;
                }
            };

            files.remove(file.path());
            if let Err(e) = remove_file_if_exists(file.path()) {
                warn!("Failed to delete evicted file {:?}: {}", file.path(), e);
            }
            total = total.saturating_sub(file.size());
            evicted += 1;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        ReconcileReport {
            total_before,
            total_after: total,
            evicted,
        }
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Storage(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

fn scan_segment_files(dir: &Path, found: &mut Vec<(PathBuf, u64, SystemTime)>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Storage(format!("failed to read {}: {}", dir.display(), e)))?;

    for entry in entries {
        let entry = entry
            .map_err(|e| Error::Storage(format!("failed to read {}: {}", dir.display(), e)))?;
        let path = entry.path();
        let meta = entry
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to stat {}: {}", path.display(), e)))?;

        if meta.is_dir() {
            scan_segment_files(&path, found)?;
            continue;
        }
        let is_segment = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(SegmentKind::is_segment_file);
        if is_segment {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((path, meta.len(), modified));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path, max_cache_size: u64) -> StorageConfig {
        StorageConfig {
            data_dir: dir.to_path_buf(),
            max_cache_size,
            reconcile_interval_secs: 300,
            eviction_target_ratio: 0.7,
        }
    }

    /// Write a file of `size` bytes and register it
    fn insert(cache: &CacheManager, dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0xAB; size]).unwrap();
        let file = cache.create_cache(path.clone());
        file.update_size().unwrap();
        cache.add_cache(file);
        path
    }

    #[test]
    fn test_load_and_try_load() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 1000));
        let path = insert(&cache, dir.path(), "000000000001.seg", 10);

        let data = cache.load(&path).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(cache.get_cache(&path).unwrap().ref_count(), 1);
        drop(data);
        assert_eq!(cache.get_cache(&path).unwrap().ref_count(), 0);

        let missing = dir.path().join("000000000002.seg");
        let err = cache.try_load(&missing).unwrap_err();
        assert!(matches!(err, Error::NotCached { .. }));
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "unregistered")]
    fn test_load_unregistered_panics() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 1000));
        let _ = cache.load(&dir.path().join("000000000009.seg"));
    }

    #[test]
    fn test_create_cache_does_not_register() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 1000));
        let path = dir.path().join("000000000001.seg");

        let file = cache.create_cache(path.clone());
        assert!(!cache.exists(&path));
        cache.add_cache(file);
        assert!(cache.exists(&path));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_scenario() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 1000));

        // The leased entry is the oldest of all and must survive anyway
        let leased = insert(&cache, dir.path(), "leased.seg", 200);
        let _reader = cache.load(&leased).unwrap();

        let oldest = insert(&cache, dir.path(), "oldest.seg", 200);
        let second = insert(&cache, dir.path(), "second.seg", 300);
        let newest = insert(&cache, dir.path(), "newest.seg", 400);
        assert_eq!(cache.total_size(), 1100);

        let report = cache.reconcile();
        assert_eq!(report.total_before, 1100);
        assert_eq!(report.total_after, 600);
        assert_eq!(report.evicted, 2);

        assert!(cache.exists(&leased));
        assert!(cache.exists(&newest));
        assert!(!cache.exists(&oldest));
        assert!(!cache.exists(&second));
        assert!(!oldest.exists());
        assert!(!second.exists());
        assert!(newest.exists());
        assert_eq!(cache.total_size(), 600);
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_no_eviction_under_target() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 1000));
        insert(&cache, dir.path(), "a.seg", 300);
        insert(&cache, dir.path(), "b.seg", 300);

        let report = cache.reconcile();
        assert_eq!(report.evicted, 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_all_leased_nothing_evicted() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 100));
        let a = insert(&cache, dir.path(), "a.seg", 300);
        let b = insert(&cache, dir.path(), "b.seg", 300);
        let _ra = cache.load(&a).unwrap();
        let _rb = cache.load(&b).unwrap();

        let report = cache.reconcile();
        assert_eq!(report.evicted, 0);
        assert!(cache.exists(&a) && cache.exists(&b));
    }

    #[test]
    fn test_eviction_revalidates_leases() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 100));
        let a = insert(&cache, dir.path(), "a.seg", 300);
        let b = insert(&cache, dir.path(), "b.seg", 300);

        let (_, candidates) = cache.inner.candidates();
        assert_eq!(candidates.len(), 2);

        // A lease taken between the candidate scan and the delete phase
        let reader = cache.load(&a).unwrap();
        let report = cache.inner.evict(candidates, cache.target_size());

        assert_eq!(report.evicted, 1);
        assert!(cache.exists(&a));
        assert!(!cache.exists(&b));
        assert_eq!(reader.len(), 300);
    }

    #[test]
    fn test_remove_busy_and_idle() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 1000));
        let path = insert(&cache, dir.path(), "000000000001.seg", 10);

        let reader = cache.load(&path).unwrap();
        let err = cache.remove(&path).unwrap_err();
        assert!(matches!(err, Error::FileBusy { refs: 1, .. }));
        assert!(cache.exists(&path));
        assert!(path.exists());

        drop(reader);
        cache.remove(&path).unwrap();
        assert!(!cache.exists(&path));
        assert!(!path.exists());

        // Removing again is a no-op
        cache.remove(&path).unwrap();
    }

    #[test]
    fn test_concurrent_loads_during_eviction() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(CacheManager::new(&test_config(dir.path(), 100)));
        let paths: Vec<_> = (1..=4)
            .map(|i| insert(&cache, dir.path(), &format!("{i:012x}.seg"), 100))
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let paths = paths.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        for path in &paths {
                            match cache.try_load(path) {
                                Ok(data) => assert_eq!(data.len(), 100),
                                Err(Error::Evicted { .. } | Error::NotCached { .. }) => {}
                                Err(e) => panic!("unexpected load error: {e}"),
                            }
                        }
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            cache.reconcile();
        }
        for reader in readers {
            reader.join().unwrap();
        }

        // Whatever survived is still readable and nothing is left retired
        cache.reconcile();
        for path in &paths {
            if let Some(file) = cache.get_cache(path) {
                assert!(!file.is_retired());
                assert_eq!(cache.try_load(path).unwrap().len(), 100);
            }
        }
    }

    #[test]
    fn test_files_locked_by_another_manager_survive() {
        let dir = tempdir().unwrap();
        let server = CacheManager::new(&test_config(dir.path(), 1000));
        let path = insert(&server, dir.path(), "000000000001.seg", 300);
        let mapped = server.load(&path).unwrap();

        // A second manager over the same root, as an operator tool would open
        let tool = CacheManager::new(&test_config(dir.path(), 100));
        assert_eq!(tool.rebuild().unwrap(), 1);

        let report = tool.reconcile();
        assert_eq!(report.evicted, 0);
        assert!(path.exists());
        assert!(tool.exists(&path));
        assert!(!tool.get_cache(&path).unwrap().is_retired());

        let err = tool.remove(&path).unwrap_err();
        assert!(matches!(err, Error::LockHeld { .. }));
        assert!(tool.exists(&path));
        assert_eq!(&mapped[..], &vec![0xAB; 300][..]);

        drop(mapped);
        assert_eq!(tool.reconcile().evicted, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_rebuild_registers_segment_files() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("products");
        std::fs::create_dir_all(&index).unwrap();
        std::fs::write(index.join("000000000001.seg"), vec![1u8; 40]).unwrap();
        std::fs::write(index.join("000000000002.snp"), vec![2u8; 60]).unwrap();
        std::fs::write(index.join("segstore.pid"), b"42\n").unwrap();

        let cache = CacheManager::new(&test_config(dir.path(), 1000));
        assert_eq!(cache.rebuild().unwrap(), 2);
        assert_eq!(cache.total_size(), 100);
        assert!(cache.exists(&index.join("000000000001.seg")));
        assert!(!cache.exists(&index.join("segstore.pid")));

        // Second scan finds nothing new
        assert_eq!(cache.rebuild().unwrap(), 0);
    }

    #[test]
    fn test_background_reconciler() {
        let dir = tempdir().unwrap();
        let cache = CacheManager::new(&test_config(dir.path(), 100));
        insert(&cache, dir.path(), "a.seg", 300);

        cache.start_reconciler(Duration::from_millis(10));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cache.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        cache.shutdown();

        assert!(cache.is_empty());
        assert!(cache.reconciler.lock().is_none());
    }

    #[test]
    fn test_open_starts_and_drop_stops() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("000000000001.seg"), vec![0u8; 10]).unwrap();

        let cache = CacheManager::open(&test_config(dir.path(), 1000)).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.reconciler.lock().is_some());
        drop(cache);
    }
}
