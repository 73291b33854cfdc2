//! Remote backend contract
//!
//! A backend is a flat key/value object namespace inside one bucket. The
//! object store only needs a handful of calls from it, so every provider
//! implements this trait directly.

use async_trait::async_trait;
use bytes::Bytes;
use segstore_common::Result;
use segstore_common::config::RemoteConfig;
use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;

use super::local::LocalBackend;
use super::memory::MemoryBackend;

/// Listing entry for one remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// Remote object storage provider
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// Stream the object at `key` into `sink`, returning the bytes written
    async fn read(&self, key: &str, sink: &mut (dyn Write + Send)) -> Result<u64>;

    /// Store `data` at `key`, replacing any previous object
    async fn write(&self, key: &str, data: Bytes) -> Result<()>;

    /// All objects whose key starts with `prefix`
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete the object at `key`; deleting a missing object succeeds
    async fn remove(&self, key: &str) -> Result<()>;

    async fn bucket_exists(&self) -> Result<bool>;

    async fn create_bucket(&self) -> Result<()>;
}

/// Build the backend selected by `config`
pub async fn connect(config: &RemoteConfig) -> Result<Arc<dyn RemoteBackend>> {
    match config {
        RemoteConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        RemoteConfig::Local { root } => Ok(Arc::new(LocalBackend::new(root))),
        #[cfg(feature = "s3")]
        RemoteConfig::S3(s3) => Ok(Arc::new(super::s3::S3Backend::new(s3).await?)),
        #[cfg(not(feature = "s3"))]
        RemoteConfig::S3(_) => Err(segstore_common::Error::Configuration(
            "S3 backend requested but segstore-storage was built without the `s3` feature"
                .into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_and_local() {
        let backend = connect(&RemoteConfig::Memory).await.unwrap();
        assert_eq!(backend.name(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let backend = connect(&RemoteConfig::Local {
            root: dir.path().join("bucket"),
        })
        .await
        .unwrap();
        assert_eq!(backend.name(), "local");
        assert!(!backend.bucket_exists().await.unwrap());
    }

    #[cfg(not(feature = "s3"))]
    #[tokio::test]
    async fn test_connect_s3_requires_feature() {
        let config = RemoteConfig::S3(segstore_common::config::S3Config {
            bucket: "segments".into(),
            ..Default::default()
        });
        assert!(connect(&config).await.is_err());
    }
}
