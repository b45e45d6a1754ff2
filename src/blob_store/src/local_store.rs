use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dcfs_lib::{DcfsError, DcfsResult};
use log::{debug, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{self, AsyncWriteExt};

use crate::{BlobReader, BlobStore};

const BLOB_DIR_NAME: &str = "blobs";
const BLOB_TMP_EXT: &str = "tmp";

/// Filesystem-backed blob store. Blobs live under
/// `<base>/blobs/<id[0:2]>/<id[2:4]>/<id[4:]>`, sharded by id prefix so a
/// single directory never collects millions of entries. Writes go to a
/// `.tmp` sibling first and are promoted by rename.
pub struct LocalBlobStore {
    blob_dir: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(base_dir: impl AsRef<Path>) -> DcfsResult<Self> {
        let blob_dir = base_dir.as_ref().join(BLOB_DIR_NAME);
        fs::create_dir_all(&blob_dir)
            .await
            .map_err(|e| DcfsError::IoError(format!("create blob dir failed: {}", e)))?;
        Ok(Self { blob_dir })
    }

    fn blob_path(&self, blob_id: &str) -> DcfsResult<PathBuf> {
        if blob_id.len() < 5 || blob_id.contains('/') || blob_id.contains("..") {
            return Err(DcfsError::BadRequest(format!(
                "invalid blob id: {}",
                blob_id
            )));
        }
        Ok(self
            .blob_dir
            .join(&blob_id[0..2])
            .join(&blob_id[2..4])
            .join(&blob_id[4..]))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        blob_id: &str,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> DcfsResult<u64> {
        let final_path = self.blob_path(blob_id)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DcfsError::IoError(format!("create blob shard failed: {}", e)))?;
        }

        let tmp_path = final_path.with_extension(BLOB_TMP_EXT);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|e| DcfsError::IoError(format!("open blob tmp failed: {}", e)))?;

        let written = io::copy(reader, &mut file).await.map_err(|e| {
            warn!("blob {} write failed: {}", blob_id, e);
            DcfsError::IoError(e.to_string())
        })?;
        file.flush()
            .await
            .map_err(|e| DcfsError::IoError(e.to_string()))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| DcfsError::IoError(format!("promote blob failed: {}", e)))?;
        debug!("blob {} stored, {} bytes", blob_id, written);
        Ok(written)
    }

    async fn get(&self, blob_id: &str) -> DcfsResult<BlobReader> {
        let path = self.blob_path(blob_id)?;
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DcfsError::NotFound(format!("blob {}", blob_id))
            } else {
                DcfsError::IoError(e.to_string())
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, blob_id: &str) -> DcfsResult<()> {
        let path = self.blob_path(blob_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DcfsError::IoError(format!(
                "delete blob {} failed: {}",
                blob_id, e
            ))),
        }
    }

    async fn size(&self, blob_id: &str) -> DcfsResult<u64> {
        let path = self.blob_path(blob_id)?;
        let md = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DcfsError::NotFound(format!("blob {}", blob_id))
            } else {
                DcfsError::IoError(e.to_string())
            }
        })?;
        Ok(md.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: BlobReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path()).await.unwrap();

        let mut data: &[u8] = b"hello blob";
        let n = store.put("aabbccdd-1", &mut data).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(store.size("aabbccdd-1").await.unwrap(), 10);

        let reader = store.get("aabbccdd-1").await.unwrap();
        assert_eq!(read_all(reader).await, b"hello blob");
    }

    #[tokio::test]
    async fn put_overwrites() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path()).await.unwrap();

        let mut first: &[u8] = b"first";
        store.put("aabbccdd-2", &mut first).await.unwrap();
        let mut second: &[u8] = b"second!";
        store.put("aabbccdd-2", &mut second).await.unwrap();

        assert_eq!(store.size("aabbccdd-2").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path()).await.unwrap();
        let err = match store.get("aabbccdd-3").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path()).await.unwrap();

        let mut data: &[u8] = b"x";
        store.put("aabbccdd-4", &mut data).await.unwrap();
        store.delete("aabbccdd-4").await.unwrap();
        store.delete("aabbccdd-4").await.unwrap();
        assert!(store.size("aabbccdd-4").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rejects_path_traversal_ids() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path()).await.unwrap();
        assert!(store.get("../../etc/passwd").await.is_err());
        assert!(store.get("ab").await.is_err());
    }
}
