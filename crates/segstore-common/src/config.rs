//! Configuration types for segstore
//!
//! Loaded from TOML; every section and field falls back to its default so a
//! config file only needs to name what it changes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local cache configuration
    pub storage: StorageConfig,
    /// Remote backend configuration
    pub remote: RemoteConfig,
    /// Durable log configuration
    pub wal: WalConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_cache_size == 0 {
            return Err(Error::Configuration(
                "storage.max_cache_size must be greater than zero".into(),
            ));
        }
        let ratio = self.storage.eviction_target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::Configuration(format!(
                "storage.eviction_target_ratio must be in (0, 1], got {ratio}"
            )));
        }
        if self.storage.reconcile_interval_secs == 0 {
            return Err(Error::Configuration(
                "storage.reconcile_interval_secs must be greater than zero".into(),
            ));
        }
        if self.wal.segment_size == 0 {
            return Err(Error::Configuration(
                "wal.segment_size must be greater than zero".into(),
            ));
        }
        if let RemoteConfig::S3(s3) = &self.remote
            && s3.bucket.is_empty()
        {
            return Err(Error::Configuration("remote.bucket must be set".into()));
        }
        Ok(())
    }
}

/// Local segment cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of all index directories
    pub data_dir: PathBuf,
    /// Local cache budget in bytes
    pub max_cache_size: u64,
    /// Seconds between eviction passes
    pub reconcile_interval_secs: u64,
    /// Fraction of the budget an eviction pass shrinks the cache to
    pub eviction_target_ratio: f64,
}

impl StorageConfig {
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_cache_size: 10 * 1024 * 1024 * 1024, // 10 GB
            reconcile_interval_secs: 300,
            eviction_target_ratio: 0.7,
        }
    }
}

/// Remote backend selection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// In-process map, lost on exit
    Memory,
    /// A directory acting as the bucket
    Local { root: PathBuf },
    /// S3 or an S3-compatible service
    S3(S3Config),
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::Local {
            root: PathBuf::from("./remote"),
        }
    }
}

/// S3 connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Address buckets as `endpoint/bucket` rather than `bucket.endpoint`
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        }
    }
}

/// Durable log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Size at which the segmented log rolls to a new file
    pub segment_size: u64,
    /// Sealed log segments kept in memory
    pub segment_cache_size: usize,
    /// Skip fsync after each segmented log append
    pub no_sync: bool,
    /// Skip fsync after each redo log write
    pub redo_no_sync: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: 16 * 1024 * 1024, // 16 MB
            segment_cache_size: 2,
            no_sync: true,
            redo_no_sync: false,
        }
    }
}
