//! Filesystem remote backend
//!
//! A directory acts as the bucket and object keys map to relative paths
//! below it. Useful for single-node deployments where the "remote" tier is
//! a mounted volume.

use async_trait::async_trait;
use bytes::Bytes;
use segstore_common::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

use super::backend::{ObjectInfo, RemoteBackend};

/// Suffix of objects still being written
const PARTIAL_SUFFIX: &str = ".partial";

/// Directory-backed remote backend
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build the path for a key
    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for component in key.split('/').filter(|c| !c.is_empty() && *c != "..") {
            path.push(component);
        }
        path
    }

    /// Convert a path below the root back to a key
    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl RemoteBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn read(&self, key: &str, sink: &mut (dyn Write + Send)) -> Result<u64> {
        let path = self.object_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ObjectNotFound {
                    key: key.to_string(),
                });
            }
            Err(e) => {
                return Err(Error::Backend(format!("failed to read {}: {}", key, e)));
            }
        };
        sink.write_all(&data)
            .map_err(|e| Error::Storage(format!("failed to write {}: {}", key, e)))?;
        Ok(data.len() as u64)
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Backend(format!("failed to create {:?}: {}", parent, e)))?;
        }

        // Publish with a rename so readers never see a partial object
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);
        fs::write(&partial, &data)
            .await
            .map_err(|e| Error::Backend(format!("failed to write {}: {}", key, e)))?;
        fs::rename(&partial, &path)
            .await
            .map_err(|e| Error::Backend(format!("failed to publish {}: {}", key, e)))?;

        debug!("Stored object {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(objects);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Backend(format!("failed to list {:?}: {}", dir, e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Backend(format!("failed to list {:?}: {}", dir, e)))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Error::Backend(format!("failed to stat {:?}: {}", path, e)))?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.path_to_key(&path) else {
                    continue;
                };
                if key.ends_with(PARTIAL_SUFFIX) || !key.starts_with(prefix) {
                    continue;
                }
                objects.push(ObjectInfo {
                    key,
                    size: meta.len(),
                    last_modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Backend(format!("failed to remove {}: {}", key, e))),
        }
    }

    async fn bucket_exists(&self) -> Result<bool> {
        match fs::metadata(&self.root).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Backend(format!("failed to stat {:?}: {}", self.root, e))),
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::Backend(format!("failed to create {:?}: {}", self.root, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_round_trip_and_listing() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("bucket"));
        assert!(!backend.bucket_exists().await.unwrap());
        backend.create_bucket().await.unwrap();
        assert!(backend.bucket_exists().await.unwrap());

        backend
            .write("idx/000000000001.seg", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        backend
            .write("idx/000000000002.snp", Bytes::from_static(b"snapshot"))
            .await
            .unwrap();
        backend
            .write("idx2/000000000001.seg", Bytes::from_static(b"other"))
            .await
            .unwrap();

        let mut out = Vec::new();
        let n = backend.read("idx/000000000001.seg", &mut out).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");

        let listed = backend.list_objects("idx/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["idx/000000000001.seg", "idx/000000000002.snp"]);
        assert_eq!(listed[1].size, 8);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let mut out = Vec::new();
        let err = backend.read("idx/nope.seg", &mut out).await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));

        // Removing a missing object is not an error
        backend.remove("idx/nope.seg").await.unwrap();
        assert!(backend.list_objects("").await.unwrap().is_empty());
    }

    #[test]
    fn test_keys_cannot_escape_root() {
        let backend = LocalBackend::new("/srv/bucket");
        assert_eq!(
            backend.object_path("../etc/passwd"),
            PathBuf::from("/srv/bucket/etc/passwd")
        );
    }
}
