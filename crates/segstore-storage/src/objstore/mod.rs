//! Remote-backed segment directory
//!
//! An [`ObjectStore`] presents one index's segment files to the indexing
//! engine. The remote backend is the durable copy; the shared
//! [`CacheManager`] holds the local copy every read is served from:
//! - `load` downloads a missing file once, then maps it from local disk
//! - `persist` writes the remote object and the local file concurrently and
//!   undoes both if either fails
//! - `remove` deletes both copies

mod backend;
mod local;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use backend::{ObjectInfo, RemoteBackend, connect};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "s3")]
pub use s3::S3Backend;

use crate::cache::{CacheManager, SegmentData};
use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use segstore_common::{Error, PID_FILENAME, Result, SegmentKind, SegmentName};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Producer of a segment's bytes.
///
/// `persist` calls it twice, once to fill the buffer sent to the remote
/// backend and once to fill the local cache file, so it must write the same
/// content each time.
pub trait SegmentWriter: Send + Sync {
    fn write_to(&self, sink: &mut dyn Write) -> io::Result<u64>;
}

impl<F> SegmentWriter for F
where
    F: Fn(&mut dyn Write) -> io::Result<u64> + Send + Sync,
{
    fn write_to(&self, sink: &mut dyn Write) -> io::Result<u64> {
        self(sink)
    }
}

/// Segment directory of one index, backed by a remote bucket
pub struct ObjectStore {
    backend: Arc<dyn RemoteBackend>,
    cache: Arc<CacheManager>,
    /// Index name, used as the remote key prefix
    prefix: String,
    /// `<data root>/<prefix>`
    dir: PathBuf,
    /// Serializes first downloads
    download: tokio::sync::Mutex<()>,
    /// Held single-writer marker
    pid_file: Mutex<Option<Flock<File>>>,
}

impl ObjectStore {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        cache: Arc<CacheManager>,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let dir = cache.root().join(&prefix);
        Self {
            backend,
            cache,
            prefix,
            dir,
            download: tokio::sync::Mutex::new(()),
            pid_file: Mutex::new(None),
        }
    }

    /// Local directory holding this index's cached files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn object_key(&self, file_name: &str) -> String {
        format!("{}/{}", self.prefix, file_name)
    }

    fn local_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Make sure the local directory and the remote bucket exist.
    ///
    /// In read-only mode nothing is created and a missing directory or
    /// bucket is an error.
    pub async fn setup(&self, read_only: bool) -> Result<()> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::Storage(format!(
                    "{} exists and is not a directory",
                    self.dir.display()
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if read_only {
                    return Err(Error::ReadOnly(format!(
                        "index directory {} does not exist",
                        self.dir.display()
                    )));
                }
                tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
                    Error::Storage(format!("failed to create {}: {}", self.dir.display(), e))
                })?;
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to stat {}: {}",
                    self.dir.display(),
                    e
                )));
            }
        }

        if !self.backend.bucket_exists().await? {
            if read_only {
                return Err(Error::ReadOnly(format!(
                    "{} bucket does not exist",
                    self.backend.name()
                )));
            }
            self.backend.create_bucket().await?;
            info!("Created {} bucket for index {}", self.backend.name(), self.prefix);
        }
        Ok(())
    }

    /// Ids of the remote objects of `kind` under this index, ascending
    pub async fn list(&self, kind: SegmentKind) -> Result<Vec<u64>> {
        let dir_prefix = format!("{}/", self.prefix);
        let objects = self.backend.list_objects(&dir_prefix).await?;

        let mut ids = Vec::new();
        for object in objects {
            let Some(name) = object.key.strip_prefix(&dir_prefix) else {
                continue;
            };
            match SegmentName::parse(name, kind) {
                Some(Ok(parsed)) => ids.push(parsed.id),
                Some(Err(e)) => warn!(key = %object.key, "skipping remote object: {}", e),
                None => {}
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Map a segment read-only, downloading it first if needed
    pub async fn load(&self, kind: SegmentKind, id: u64) -> Result<SegmentData> {
        let name = SegmentName::new(kind, id).file_name();
        self.prepare_file(&name).await?;

        let path = self.local_path(&name);
        match self.cache.try_load(&path) {
            // Evicted between download and mapping; fetch it again
            Err(Error::Evicted { .. } | Error::NotCached { .. }) => {
                debug!(path = %path.display(), "cache entry vanished before load, retrying");
                self.prepare_file(&name).await?;
                self.cache.try_load(&path)
            }
            other => other,
        }
    }

    /// Guarantee a local copy of `file_name`, downloading it at most once
    pub async fn prepare_file(&self, file_name: &str) -> Result<()> {
        let path = self.local_path(file_name);
        if self.cache.exists(&path) {
            return Ok(());
        }

        let _guard = self.download.lock().await;
        // Another caller may have finished the download while we waited
        if self.cache.exists(&path) {
            return Ok(());
        }

        let key = self.object_key(file_name);
        match self.download_file(&key, &path).await {
            Ok(size) => {
                info!("Downloaded {} ({} bytes)", key, size);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.cache.remove(&path) {
                    warn!("Failed to clean up partial download {:?}: {}", path, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn download_file(&self, key: &str, path: &Path) -> Result<u64> {
        // Drop any stale copy left over from a previous process
        self.cache.remove(path)?;

        let entry = self.cache.create_cache(path);
        let mut writer = entry.get_writer()?;
        self.backend.read(key, &mut writer).await?;
        writer.sync()?;
        writer.close();

        let size = entry.update_size()?;
        self.cache.add_cache(entry);
        Ok(size)
    }

    /// Write a new segment to the remote backend and the local cache.
    ///
    /// Both writes run concurrently. If either fails, the local file and the
    /// remote object are both removed and the combined failure is returned.
    pub async fn persist(
        &self,
        kind: SegmentKind,
        id: u64,
        writer: impl SegmentWriter + 'static,
    ) -> Result<()> {
        let name = SegmentName::new(kind, id).file_name();
        let key = self.object_key(&name);
        let path = self.local_path(&name);
        let writer: Arc<dyn SegmentWriter> = Arc::new(writer);

        let remote = {
            let writer = Arc::clone(&writer);
            let key = key.clone();
            async move {
                let mut buf = Vec::new();
                writer
                    .write_to(&mut buf)
                    .map_err(|e| Error::Storage(format!("failed to serialize {}: {}", key, e)))?;
                self.backend.write(&key, Bytes::from(buf)).await
            }
        };

        let entry = self.cache.create_cache(path.clone());
        let local = {
            let entry = Arc::clone(&entry);
            let task = tokio::task::spawn_blocking(move || -> Result<u64> {
                let mut lease = entry.get_writer()?;
                lease.reset()?;
                writer.write_to(&mut lease).map_err(|e| {
                    Error::Storage(format!("failed to write {}: {}", lease.path().display(), e))
                })?;
                lease.sync()?;
                lease.close();
                entry.update_size()
            });
            async move {
                task.await
                    .map_err(|e| Error::Storage(format!("local write task failed: {}", e)))?
            }
        };

        let (remote, local) = tokio::join!(remote, local);

        match (remote, local) {
            (Ok(()), Ok(size)) => {
                self.cache.add_cache(entry);
                debug!("Persisted {} ({} bytes)", key, size);
                Ok(())
            }
            (remote, local) => {
                let mut reasons = Vec::new();
                if let Err(e) = &remote {
                    reasons.push(format!("remote: {e}"));
                }
                if let Err(e) = &local {
                    reasons.push(format!("local: {e}"));
                }
                let reason = reasons.join("; ");
                error!("Failed to persist {}: {}", key, reason);

                if let Err(e) = self.cache.remove(&path) {
                    warn!("Failed to remove local copy of {}: {}", key, e);
                }
                if let Err(e) = self.backend.remove(&key).await {
                    warn!("Failed to remove remote copy of {}: {}", key, e);
                }
                Err(Error::Persist { key, reason })
            }
        }
    }

    /// Delete a segment remotely and locally.
    ///
    /// Both deletions are always attempted; the first failure is returned.
    pub async fn remove(&self, kind: SegmentKind, id: u64) -> Result<()> {
        let name = SegmentName::new(kind, id).file_name();
        let remote = self.backend.remove(&self.object_key(&name)).await;
        let local = self.cache.remove(&self.local_path(&name));
        remote.and(local)
    }

    /// Object count and total bytes of this index in the remote backend.
    ///
    /// A failed listing is logged and reported as empty.
    pub async fn stats(&self) -> (u64, u64) {
        match self.backend.list_objects(&format!("{}/", self.prefix)).await {
            Ok(objects) => (
                objects.len() as u64,
                objects.iter().map(|o| o.size).sum(),
            ),
            Err(e) => {
                warn!("Failed to list objects for index {}: {}", self.prefix, e);
                (0, 0)
            }
        }
    }

    /// Flush the local directory's metadata to stable storage
    pub fn sync(&self) -> Result<()> {
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| Error::Storage(format!("failed to sync {}: {}", self.dir.display(), e)))
    }

    /// Claim the index directory for this process.
    ///
    /// Takes an exclusive lock on the pid file without waiting and records
    /// the process id in it.
    pub fn lock(&self) -> Result<()> {
        let mut held = self.pid_file.lock();
        if held.is_some() {
            return Ok(());
        }

        let path = self.dir.join(PID_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))?;
        let mut file = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(
            |(_, errno)| {
                if errno == Errno::EWOULDBLOCK {
                    Error::LockHeld { path: path.clone() }
                } else {
                    Error::Storage(format!("failed to lock {}: {}", path.display(), errno))
                }
            },
        )?;

        file.set_len(0)
            .map_err(|e| Error::Storage(format!("failed to truncate pid file: {}", e)))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| Error::Storage(format!("failed to write pid: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("failed to sync pid file: {}", e)))?;

        debug!("Locked index directory {}", self.dir.display());
        *held = Some(file);
        Ok(())
    }

    /// Release the directory lock and delete the pid file
    pub fn unlock(&self) -> Result<()> {
        let Some(file) = self.pid_file.lock().take() else {
            return Ok(());
        };
        drop(file);

        let path = self.dir.join(PID_FILENAME);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "failed to remove pid file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use segstore_common::config::StorageConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{TempDir, tempdir};

    fn cache_for(dir: &Path) -> Arc<CacheManager> {
        Arc::new(CacheManager::new(&StorageConfig {
            data_dir: dir.to_path_buf(),
            max_cache_size: 1 << 20,
            ..Default::default()
        }))
    }

    async fn memory_store() -> (TempDir, Arc<MemoryBackend>, ObjectStore) {
        let dir = tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = ObjectStore::new(backend.clone(), cache_for(dir.path()), "products");
        store.setup(false).await.unwrap();
        (dir, backend, store)
    }

    fn bytes_writer(data: &'static [u8]) -> impl SegmentWriter + 'static {
        move |sink: &mut dyn Write| -> io::Result<u64> {
            sink.write_all(data)?;
            Ok(data.len() as u64)
        }
    }

    /// Memory backend whose writes can be made to fail
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl RemoteBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn read(&self, key: &str, sink: &mut (dyn Write + Send)) -> Result<u64> {
            self.inner.read(key, sink).await
        }

        async fn write(&self, key: &str, data: Bytes) -> Result<()> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(Error::backend("injected write failure"));
            }
            self.inner.write(key, data).await
        }

        async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(Error::backend("injected list failure"));
            }
            self.inner.list_objects(prefix).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }

        async fn bucket_exists(&self) -> Result<bool> {
            self.inner.bucket_exists().await
        }

        async fn create_bucket(&self) -> Result<()> {
            self.inner.create_bucket().await
        }
    }

    #[tokio::test]
    async fn test_setup_read_only() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = ObjectStore::new(backend.clone(), cache_for(dir.path()), "products");

        let err = store.setup(true).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert!(!store.dir().exists());

        store.setup(false).await.unwrap();
        assert!(store.dir().is_dir());
        assert!(backend.bucket_exists().await.unwrap());
        store.setup(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_read_only_missing_bucket() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = ObjectStore::new(backend.clone(), cache_for(dir.path()), "products");
        std::fs::create_dir_all(store.dir()).unwrap();

        let err = store.setup(true).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert!(err.to_string().contains("bucket"));
        assert!(!backend.bucket_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let (_dir, backend, store) = memory_store().await;

        store
            .persist(SegmentKind::Segment, 1, bytes_writer(b"segment one"))
            .await
            .unwrap();

        assert!(backend.contains("products/000000000001.seg"));
        let path = store.dir().join("000000000001.seg");
        assert!(store.cache.exists(&path));
        assert_eq!(store.cache.get_cache(&path).unwrap().size(), 11);

        let data = store.load(SegmentKind::Segment, 1).await.unwrap();
        assert_eq!(&data[..], b"segment one");
        // Served from the local copy
        assert_eq!(backend.read_count("products/000000000001.seg"), 0);
    }

    #[tokio::test]
    async fn test_load_downloads_missing_file() {
        let (_dir, backend, store) = memory_store().await;
        backend
            .write("products/00000000000a.snp", Bytes::from_static(b"snap"))
            .await
            .unwrap();

        let data = store.load(SegmentKind::Snapshot, 10).await.unwrap();
        assert_eq!(&data[..], b"snap");
        assert!(store.dir().join("00000000000a.snp").exists());

        let err = store.load(SegmentKind::Segment, 99).await.unwrap_err();
        assert!(err.is_not_found());
        // Failed download leaves nothing behind
        let missing = store.dir().join("000000000063.seg");
        assert!(!store.cache.exists(&missing));
        assert!(!missing.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_download_once() {
        let (_dir, backend, store) = memory_store().await;
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        backend
            .write("products/000000000007.seg", Bytes::from(content.clone()))
            .await
            .unwrap();

        let store = Arc::new(store);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let data = store.load(SegmentKind::Segment, 7).await.unwrap();
                    data.to_vec()
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap(), content);
        }
        assert_eq!(backend.read_count("products/000000000007.seg"), 1);
    }

    #[tokio::test]
    async fn test_persist_remote_failure_cleans_up_both_sides() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FlakyBackend::default());
        let store = ObjectStore::new(backend.clone(), cache_for(dir.path()), "products");
        store.setup(false).await.unwrap();
        backend.fail_writes.store(true, Ordering::Relaxed);

        let err = store
            .persist(SegmentKind::Segment, 2, bytes_writer(b"doomed"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persist { .. }));
        assert!(err.to_string().contains("remote"));

        let path = store.dir().join("000000000002.seg");
        assert!(!store.cache.exists(&path));
        assert!(!path.exists());
        assert!(!backend.inner.contains("products/000000000002.seg"));
    }

    #[tokio::test]
    async fn test_persist_local_failure_cleans_up_both_sides() {
        let (_dir, backend, store) = memory_store().await;

        // Another writer holds the local file, so the local half fails
        let path = store.dir().join("000000000003.seg");
        let other = store.cache.create_cache(path.clone());
        let held = other.get_writer().unwrap();

        let err = store
            .persist(SegmentKind::Segment, 3, bytes_writer(b"contended"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persist { .. }));
        assert!(err.to_string().contains("local"));
        drop(held);

        assert!(!store.cache.exists(&path));
        assert!(!backend.contains("products/000000000003.seg"));
    }

    #[tokio::test]
    async fn test_list_filters_kind_and_prefix() {
        let (_dir, backend, store) = memory_store().await;
        for key in [
            "products/000000000002.seg",
            "products/000000000001.seg",
            "products/000000000003.snp",
            "products/not-hex.seg",
            "products2/000000000009.seg",
        ] {
            backend.write(key, Bytes::from_static(b"x")).await.unwrap();
        }

        assert_eq!(store.list(SegmentKind::Segment).await.unwrap(), vec![1, 2]);
        assert_eq!(store.list(SegmentKind::Snapshot).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_remove_and_stats() {
        let (_dir, backend, store) = memory_store().await;
        store
            .persist(SegmentKind::Segment, 1, bytes_writer(b"aaaa"))
            .await
            .unwrap();
        store
            .persist(SegmentKind::Segment, 2, bytes_writer(b"bbbbbb"))
            .await
            .unwrap();
        assert_eq!(store.stats().await, (2, 10));

        store.remove(SegmentKind::Segment, 1).await.unwrap();
        assert!(!backend.contains("products/000000000001.seg"));
        assert!(!store.dir().join("000000000001.seg").exists());
        assert_eq!(store.stats().await, (1, 6));
    }

    #[tokio::test]
    async fn test_remove_reports_busy_but_deletes_remote() {
        let (_dir, backend, store) = memory_store().await;
        store
            .persist(SegmentKind::Segment, 4, bytes_writer(b"pinned"))
            .await
            .unwrap();
        let reader = store.load(SegmentKind::Segment, 4).await.unwrap();

        let err = store.remove(SegmentKind::Segment, 4).await.unwrap_err();
        assert!(matches!(err, Error::FileBusy { .. }));
        assert!(!backend.contains("products/000000000004.seg"));
        assert_eq!(&reader[..], b"pinned");
    }

    #[tokio::test]
    async fn test_stats_on_listing_failure() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FlakyBackend::default());
        let store = ObjectStore::new(backend.clone(), cache_for(dir.path()), "products");
        backend.fail_writes.store(true, Ordering::Relaxed);
        assert_eq!(store.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let (_dir, backend, store) = memory_store().await;
        store.lock().unwrap();
        let pid_path = store.dir().join(PID_FILENAME);
        let content = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        // A second store over the same directory is refused
        let other = ObjectStore::new(backend, Arc::clone(&store.cache), "products");
        assert!(matches!(other.lock(), Err(Error::LockHeld { .. })));

        store.unlock().unwrap();
        assert!(!pid_path.exists());
        other.lock().unwrap();
        other.unlock().unwrap();
        store.sync().unwrap();
    }
}
