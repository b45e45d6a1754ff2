use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use dcfs_lib::{DcfsError, DcfsResult};
use fs2::FileExt;
use log::debug;

// Attribute schema. Every node directory carries its metadata under these
// dotted keys, either as real xattrs or inside a sidecar document.
pub const ID_ATTR: &str = "user.dcfs.id";
pub const PARENTID_ATTR: &str = "user.dcfs.parentid";
pub const NAME_ATTR: &str = "user.dcfs.name";
pub const TYPE_ATTR: &str = "user.dcfs.type";
pub const BLOBID_ATTR: &str = "user.dcfs.blobid";
pub const BLOBSIZE_ATTR: &str = "user.dcfs.blobsize";
pub const OWNER_IDP_ATTR: &str = "user.dcfs.owner.idp";
pub const OWNER_ID_ATTR: &str = "user.dcfs.owner.id";
pub const OWNER_TYPE_ATTR: &str = "user.dcfs.owner.type";
pub const MTIME_ATTR: &str = "user.dcfs.mtime";
pub const TMTIME_ATTR: &str = "user.dcfs.tmtime";
pub const TREESIZE_ATTR: &str = "user.dcfs.treesize";
pub const PROPAGATION_ATTR: &str = "user.dcfs.propagation";
pub const PROCESSING_ATTR: &str = "user.dcfs.processing";
pub const LOCK_ATTR: &str = "user.dcfs.lock";
pub const SPACE_NAME_ATTR: &str = "user.dcfs.space.name";
pub const SPACE_TYPE_ATTR: &str = "user.dcfs.space.type";
pub const SPACE_DESCRIPTION_ATTR: &str = "user.dcfs.space.description";
pub const SPACE_QUOTA_ATTR: &str = "user.dcfs.space.quota";
pub const SPACE_DISABLED_ATTR: &str = "user.dcfs.space.disabled";
pub const CHECKSUM_PREFIX: &str = "user.dcfs.cs.";
pub const GRANT_PREFIX: &str = "user.dcfs.grant.";
pub const METADATA_PREFIX: &str = "user.dcfs.md.";

pub const TYPE_FILE: &str = "1";
pub const TYPE_DIR: &str = "2";

const SIDECAR_FILE_NAME: &str = ".meta.json";
const SIDECAR_LOCK_NAME: &str = ".meta.json.flock";

const MAX_TRANSIENT_RETRIES: u32 = 10;
const TRANSIENT_BACKOFF_MS: u64 = 3;

/// Typed access to a node's attribute namespace. Single-key writes are
/// atomic, multi-key composites are not; callers serialize those through the
/// filelocks module.
pub trait MetadataBackend: Send + Sync {
    /// `NotFound` if the node path is absent, `AttrNotFound` if the path
    /// exists but the key does not.
    fn get(&self, path: &Path, key: &str) -> DcfsResult<String>;
    fn set(&self, path: &Path, key: &str, value: &str) -> DcfsResult<()>;
    fn remove(&self, path: &Path, key: &str) -> DcfsResult<()>;
    fn list(&self, path: &Path) -> DcfsResult<Vec<String>>;
    fn all(&self, path: &Path) -> DcfsResult<HashMap<String, String>>;

    /// Writes every pair, continuing past individual failures and returning
    /// the last error seen.
    fn set_multiple(&self, path: &Path, attrs: &[(String, String)]) -> DcfsResult<()> {
        let mut last_err = None;
        for (key, value) in attrs {
            if let Err(e) = self.set(path, key, value) {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs `op`, retrying transient errno results (EAGAIN, EINTR) with linear
/// backoff. Contention on the attr namespace must never surface to callers.
fn with_transient_retry<T>(
    mut op: impl FnMut() -> std::io::Result<T>,
) -> std::io::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                let transient = matches!(e.raw_os_error(), Some(11) | Some(4));
                if !transient || attempt >= MAX_TRANSIENT_RETRIES {
                    return Err(e);
                }
                attempt += 1;
                debug!("transient attr error ({}), retry {}", e, attempt);
                std::thread::sleep(Duration::from_millis(
                    TRANSIENT_BACKOFF_MS * attempt as u64,
                ));
            }
        }
    }
}

fn map_path_err(path: &Path, err: std::io::Error) -> DcfsError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DcfsError::NotFound(path.to_string_lossy().to_string())
    } else {
        DcfsError::IoError(format!("{}: {}", path.display(), err))
    }
}

/// Metadata as host filesystem extended attributes.
pub struct XattrsBackend;

impl MetadataBackend for XattrsBackend {
    fn get(&self, path: &Path, key: &str) -> DcfsResult<String> {
        let value = with_transient_retry(|| xattr::get(path, key))
            .map_err(|e| map_path_err(path, e))?;
        match value {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|e| DcfsError::Internal(format!("attr {} not utf-8: {}", key, e))),
            None => Err(DcfsError::AttrNotFound(key.to_string())),
        }
    }

    fn set(&self, path: &Path, key: &str, value: &str) -> DcfsResult<()> {
        with_transient_retry(|| xattr::set(path, key, value.as_bytes()))
            .map_err(|e| map_path_err(path, e))
    }

    fn remove(&self, path: &Path, key: &str) -> DcfsResult<()> {
        match with_transient_retry(|| xattr::remove(path, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(61) => Ok(()), // ENODATA
            Err(e) => Err(map_path_err(path, e)),
        }
    }

    fn list(&self, path: &Path) -> DcfsResult<Vec<String>> {
        let attrs = with_transient_retry(|| xattr::list(path))
            .map_err(|e| map_path_err(path, e))?;
        Ok(attrs
            .filter_map(|name| name.to_str().map(|s| s.to_string()))
            .collect())
    }

    fn all(&self, path: &Path) -> DcfsResult<HashMap<String, String>> {
        let mut out = HashMap::new();
        for key in self.list(path)? {
            match self.get(path, &key) {
                Ok(value) => {
                    out.insert(key, value);
                }
                Err(DcfsError::AttrNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Metadata as one JSON document per node, written tmp+rename. Used where
/// user xattrs are unavailable and throughout the test suite.
pub struct SidecarBackend;

impl SidecarBackend {
    fn load(&self, path: &Path) -> DcfsResult<HashMap<String, String>> {
        if !path.exists() {
            return Err(DcfsError::NotFound(path.to_string_lossy().to_string()));
        }
        let sidecar = path.join(SIDECAR_FILE_NAME);
        match std::fs::read_to_string(&sidecar) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| DcfsError::Internal(format!("corrupt sidecar {}: {}", sidecar.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(map_path_err(&sidecar, e)),
        }
    }

    fn store(&self, path: &Path, attrs: &HashMap<String, String>) -> DcfsResult<()> {
        let sidecar = path.join(SIDECAR_FILE_NAME);
        let tmp = path.join(format!("{}.tmp", SIDECAR_FILE_NAME));
        let json =
            serde_json::to_string(attrs).map_err(|e| DcfsError::Internal(e.to_string()))?;
        let mut file = std::fs::File::create(&tmp).map_err(|e| map_path_err(&tmp, e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| map_path_err(&tmp, e))?;
        std::fs::rename(&tmp, &sidecar).map_err(|e| map_path_err(&sidecar, e))
    }

    /// Read-modify-write under the sidecar's own advisory lock.
    fn update(
        &self,
        path: &Path,
        f: impl FnOnce(&mut HashMap<String, String>) -> DcfsResult<()>,
    ) -> DcfsResult<()> {
        if !path.exists() {
            return Err(DcfsError::NotFound(path.to_string_lossy().to_string()));
        }
        let lock_path = path.join(SIDECAR_LOCK_NAME);
        let lock_file = with_transient_retry(|| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)
        })
        .map_err(|e| map_path_err(&lock_path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| DcfsError::IoError(format!("sidecar lock failed: {}", e)))?;

        let result = (|| {
            let mut attrs = self.load(path)?;
            f(&mut attrs)?;
            self.store(path, &attrs)
        })();

        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }
}

impl MetadataBackend for SidecarBackend {
    fn get(&self, path: &Path, key: &str) -> DcfsResult<String> {
        self.load(path)?
            .remove(key)
            .ok_or_else(|| DcfsError::AttrNotFound(key.to_string()))
    }

    fn set(&self, path: &Path, key: &str, value: &str) -> DcfsResult<()> {
        self.update(path, |attrs| {
            attrs.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove(&self, path: &Path, key: &str) -> DcfsResult<()> {
        self.update(path, |attrs| {
            attrs.remove(key);
            Ok(())
        })
    }

    fn list(&self, path: &Path) -> DcfsResult<Vec<String>> {
        Ok(self.load(path)?.into_keys().collect())
    }

    fn all(&self, path: &Path) -> DcfsResult<HashMap<String, String>> {
        self.load(path)
    }

    fn set_multiple(&self, path: &Path, attrs: &[(String, String)]) -> DcfsResult<()> {
        self.update(path, |map| {
            for (key, value) in attrs {
                map.insert(key.clone(), value.clone());
            }
            Ok(())
        })
    }
}
