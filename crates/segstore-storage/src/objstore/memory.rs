//! In-process remote backend
//!
//! Keeps objects in a map. Used for single-process deployments that don't
//! need remote durability, and by tests, which can inspect how many times
//! each object was read.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use segstore_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use super::backend::{ObjectInfo, RemoteBackend};

/// Map-backed remote backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, (Bytes, SystemTime)>>,
    reads: RwLock<HashMap<String, u64>>,
    bucket: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read` calls made for `key`
    pub fn read_count(&self, key: &str) -> u64 {
        self.reads.read().get(key).copied().unwrap_or(0)
    }

    /// Whether an object is stored at `key`
    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, key: &str, sink: &mut (dyn Write + Send)) -> Result<u64> {
        *self.reads.write().entry(key.to_string()).or_default() += 1;

        let data = self
            .objects
            .read()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::ObjectNotFound {
                key: key.to_string(),
            })?;
        sink.write_all(&data)
            .map_err(|e| Error::Storage(format!("failed to write {}: {}", key, e)))?;
        Ok(data.len() as u64)
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .insert(key.to_string(), (data, SystemTime::now()));
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let objects = self.objects.read();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (data, modified))| ObjectInfo {
                key: key.clone(),
                size: data.len() as u64,
                last_modified: *modified,
            })
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(self.bucket.load(Ordering::Acquire))
    }

    async fn create_bucket(&self) -> Result<()> {
        self.bucket.store(true, Ordering::Release);
        Ok(())
    }
}
