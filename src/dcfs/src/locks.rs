use std::path::PathBuf;

use dcfs_lib::{DcfsError, DcfsResult, LockInfo, RequestContext};
use log::debug;

use crate::filelocks;
use crate::lookup::Lookup;
use crate::metadata::LOCK_ATTR;
use crate::node::Node;

const LOCK_FILE_EXT: &str = "lock";

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Node {
    /// `<node-dir>.lock`, sibling of the node directory so it survives
    /// attribute rewrites and is found without reading attributes.
    pub fn lock_file_path(&self, lu: &Lookup) -> DcfsResult<PathBuf> {
        let dir = lu.node_dir(&self.id)?;
        let mut name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        name.push('.');
        name.push_str(LOCK_FILE_EXT);
        Ok(dir.with_file_name(name))
    }

    /// Reads the current lock, treating an expired one as absent.
    pub async fn read_lock(&self, lu: &Lookup) -> DcfsResult<Option<LockInfo>> {
        if self.id.is_empty() {
            // a node that never materialized cannot carry a lock
            return Ok(None);
        }
        let path = self.lock_file_path(lu)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DcfsError::IoError(format!("read lock failed: {}", e))),
        };
        let lock: LockInfo = serde_json::from_str(&json)
            .map_err(|e| DcfsError::Internal(format!("corrupt lock file {}: {}", path.display(), e)))?;
        if lock.is_expired(now_secs()) {
            debug!("dropping expired lock {} on {}", lock.lock_id, self.id);
            let _ = tokio::fs::remove_file(&path).await;
            let _ = self.remove_attr(lu, LOCK_ATTR);
            return Ok(None);
        }
        Ok(Some(lock))
    }

    /// Places a lock. Requires that no live lock exists; all lock writes are
    /// serialized through the lock file's own advisory lock.
    pub async fn set_lock(&self, lu: &Lookup, _ctx: &RequestContext, lock: &LockInfo) -> DcfsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(DcfsError::BadRequest("missing lock id".to_string()));
        }
        let path = self.lock_file_path(lu)?;
        let _guard =
            filelocks::acquire_write_lock(&path, lu.lock_cycles(), lu.lock_factor_ms()).await?;

        if let Some(existing) = self.read_lock(lu).await? {
            return Err(DcfsError::PreconditionFailed(format!(
                "already locked by {}",
                existing.lock_id
            )));
        }
        self.write_lock_file(lu, &path, lock).await
    }

    /// Replaces the lock. The caller must present the current lock id,
    /// either inside the new lock or as `existing_lock_id`.
    pub async fn refresh_lock(
        &self,
        lu: &Lookup,
        _ctx: &RequestContext,
        lock: &LockInfo,
        existing_lock_id: Option<&str>,
    ) -> DcfsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(DcfsError::BadRequest("missing lock id".to_string()));
        }
        let path = self.lock_file_path(lu)?;
        let _guard =
            filelocks::acquire_write_lock(&path, lu.lock_cycles(), lu.lock_factor_ms()).await?;

        let current = self
            .read_lock(lu)
            .await?
            .ok_or_else(|| DcfsError::PreconditionFailed(format!("{} is not locked", self.id)))?;
        let authorized = lock.lock_id == current.lock_id
            || existing_lock_id == Some(current.lock_id.as_str());
        if !authorized {
            return Err(DcfsError::PreconditionFailed(
                "mismatching lock id".to_string(),
            ));
        }
        self.write_lock_file(lu, &path, lock).await
    }

    /// Removes the lock; the presented lock id must match the holder.
    pub async fn unlock(&self, lu: &Lookup, _ctx: &RequestContext, lock: &LockInfo) -> DcfsResult<()> {
        let path = self.lock_file_path(lu)?;
        let _guard =
            filelocks::acquire_write_lock(&path, lu.lock_cycles(), lu.lock_factor_ms()).await?;

        let current = self
            .read_lock(lu)
            .await?
            .ok_or_else(|| DcfsError::PreconditionFailed(format!("{} is not locked", self.id)))?;
        if lock.lock_id != current.lock_id {
            return Err(DcfsError::Locked(current.lock_id));
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| DcfsError::IoError(format!("remove lock failed: {}", e)))?;
        self.remove_attr(lu, LOCK_ATTR)?;
        Ok(())
    }

    async fn write_lock_file(&self, lu: &Lookup, path: &std::path::Path, lock: &LockInfo) -> DcfsResult<()> {
        let json = serde_json::to_string(lock).map_err(|e| DcfsError::Internal(e.to_string()))?;
        tokio::fs::write(path, &json)
            .await
            .map_err(|e| DcfsError::IoError(format!("write lock failed: {}", e)))?;
        // mirrored into the attribute namespace for listings
        self.set_attr(lu, LOCK_ATTR, &json)?;
        Ok(())
    }
}
