use std::path::{Path, PathBuf};

use dcfs_lib::{DcfsError, DcfsResult};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

const CONFIG_FILE_NAME: &str = "dcfs.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackendKind {
    /// Host filesystem extended attributes.
    Xattrs,
    /// JSON sidecar document per node, for hosts without user xattrs.
    Sidecar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DcfsConfig {
    /// Storage root. Everything (nodes, spaces, uploads, trash, indexes)
    /// lives below it.
    pub root: PathBuf,
    pub metadata_backend: MetadataBackendKind,
    pub tree_time_accounting: bool,
    pub tree_size_accounting: bool,
    /// Advisory lock retry budget, see the filelocks module.
    pub max_acquire_lock_cycles: u32,
    /// Per-cycle sleep factor in milliseconds.
    pub lock_cycle_duration_factor_ms: u64,
    /// When true, FinalizeUpload only assembles; promotion is driven by
    /// PostprocessingFinished events.
    pub async_file_uploads: bool,
    pub postprocessing_workers: usize,
    pub stat_cache_ttl_secs: u64,
    /// Default quota in bytes for new personal spaces, unset means
    /// unlimited.
    pub personal_space_quota: Option<u64>,
    /// Interval of the background tree reconciler, 0 disables it.
    pub reconciler_interval_secs: u64,
}

impl Default for DcfsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/dcfs"),
            metadata_backend: MetadataBackendKind::Xattrs,
            tree_time_accounting: true,
            tree_size_accounting: true,
            max_acquire_lock_cycles: 25,
            lock_cycle_duration_factor_ms: 30,
            async_file_uploads: false,
            postprocessing_workers: 3,
            stat_cache_ttl_secs: 60,
            personal_space_quota: None,
            reconciler_interval_secs: 0,
        }
    }
}

impl DcfsConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Loads `dcfs.json` from the storage root, writing one with defaults on
    /// first start.
    pub async fn load_or_init(root: impl AsRef<Path>) -> DcfsResult<Self> {
        let root = root.as_ref();
        if !root.exists() {
            fs::create_dir_all(root)
                .await
                .map_err(|e| DcfsError::IoError(format!("create storage root failed: {}", e)))?;
        }

        let config_path = root.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let config = Self::new(root);
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| DcfsError::Internal(e.to_string()))?;
            let mut file = File::create(&config_path)
                .await
                .map_err(|e| DcfsError::IoError(format!("create config failed: {}", e)))?;
            file.write_all(json.as_bytes())
                .await
                .map_err(|e| DcfsError::IoError(format!("write config failed: {}", e)))?;
            return Ok(config);
        }

        let json = fs::read_to_string(&config_path).await.map_err(|e| {
            warn!("read config failed: {}", e);
            DcfsError::IoError(format!("read config failed: {}", e))
        })?;
        let mut config = serde_json::from_str::<Self>(&json).map_err(|e| {
            warn!("parse config failed: {}", e);
            DcfsError::BadRequest(format!("invalid config: {}", e))
        })?;
        config.root = root.to_path_buf();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_writes_defaults_and_reloads() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("storage");

        let first = DcfsConfig::load_or_init(&root).await.unwrap();
        assert_eq!(first.root, root);
        assert!(root.join(CONFIG_FILE_NAME).exists());

        let second = DcfsConfig::load_or_init(&root).await.unwrap();
        assert_eq!(second.max_acquire_lock_cycles, first.max_acquire_lock_cycles);
        assert_eq!(second.metadata_backend, MetadataBackendKind::Xattrs);
    }
}
