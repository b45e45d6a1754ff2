use dcfs_lib::{new_id, DcfsError, DcfsResult, User};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::filelocks;
use crate::lookup::Lookup;
use crate::metadata::{BLOBID_ATTR, BLOBSIZE_ATTR, CHECKSUM_PREFIX, PROCESSING_ATTR};
use crate::node::{now_nanos, Node, NodeType};
use crate::tree::Tree;

/// Chunked write state of one upload, persisted as
/// `uploads/<upload_id>.info` beside the temp payload. Mutations of offset
/// and flags happen under the info file's advisory lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub space_id: String,
    pub parent_id: String,
    pub node_id: String,
    /// Blob id reserved for the finalized content.
    pub blob_id: String,
    pub name: String,
    /// External path of the target, kept for the terminal notification.
    pub path: String,
    pub size: u64,
    /// Expected SHA-256 hex digest, verified at assembly when present.
    pub checksum: Option<String>,
    pub executing_user: User,
    /// Unix seconds; a session past this point is expired.
    pub expiration: Option<u64>,
    pub offset: u64,
    /// True once assembly passed and the session waits for a
    /// post-processing outcome.
    pub processing: bool,
    /// Whether the target node pre-existed (overwrite) or was created as a
    /// placeholder by this session.
    pub node_existed: bool,
    pub previous_blob_id: String,
    pub previous_blob_size: u64,
    pub created_at: u64,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl UploadSession {
    /// Reserves ids, creates the placeholder node (or marks an existing one
    /// as processing) and persists the session document.
    #[allow(clippy::too_many_arguments)]
    pub async fn initiate(
        lu: &Lookup,
        tree: &Tree,
        executing_user: &User,
        parent: &Node,
        target: &Node,
        name: &str,
        path: &str,
        size: u64,
        checksum: Option<String>,
        expiration: Option<u64>,
    ) -> DcfsResult<UploadSession> {
        let upload_id = new_id();
        let session = UploadSession {
            upload_id: upload_id.clone(),
            space_id: parent.space_id.clone(),
            parent_id: parent.id.clone(),
            node_id: if target.exists {
                target.id.clone()
            } else {
                new_id()
            },
            blob_id: new_id(),
            name: name.to_string(),
            path: path.to_string(),
            size,
            checksum: checksum.map(|c| c.trim().to_ascii_lowercase()),
            executing_user: executing_user.clone(),
            expiration,
            offset: 0,
            processing: false,
            node_existed: target.exists,
            previous_blob_id: if target.exists {
                target.blob_id.clone()
            } else {
                String::new()
            },
            previous_blob_size: if target.exists { target.blob_size } else { 0 },
            created_at: now_secs(),
        };

        if target.exists {
            target.set_attr(lu, PROCESSING_ATTR, &upload_id)?;
        } else {
            let placeholder = Node {
                space_id: session.space_id.clone(),
                id: session.node_id.clone(),
                parent_id: session.parent_id.clone(),
                name: session.name.clone(),
                blob_id: String::new(),
                blob_size: 0,
                owner: Some(executing_user.id.clone()),
                node_type: NodeType::File,
                exists: false,
            };
            tree.touch_file(&placeholder, Some(&upload_id)).await?;
        }

        session.persist(lu).await?;
        info!(
            "upload {} initiated for {}/{} ({} bytes)",
            upload_id, session.parent_id, session.name, size
        );
        Ok(session)
    }

    pub async fn load(lu: &Lookup, upload_id: &str) -> DcfsResult<UploadSession> {
        let info_path = lu.upload_info_path(upload_id);
        let json = fs::read_to_string(&info_path)
            .await
            .map_err(|_| DcfsError::NotFound(format!("upload {}", upload_id)))?;
        serde_json::from_str(&json)
            .map_err(|e| DcfsError::Internal(format!("corrupt upload session {}: {}", upload_id, e)))
    }

    pub async fn persist(&self, lu: &Lookup) -> DcfsResult<()> {
        let json = serde_json::to_string(self).map_err(|e| DcfsError::Internal(e.to_string()))?;
        fs::write(lu.upload_info_path(&self.upload_id), json)
            .await
            .map_err(|e| DcfsError::IoError(format!("persist upload session failed: {}", e)))
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        match self.expiration {
            Some(exp) => exp <= now_secs,
            None => false,
        }
    }

    /// Writes a chunk at `offset` into the temp payload. Writes may patch
    /// earlier ranges but must not leave holes.
    pub async fn write_chunk(&mut self, lu: &Lookup, offset: u64, data: &[u8]) -> DcfsResult<u64> {
        let info_path = lu.upload_info_path(&self.upload_id);
        let _guard =
            filelocks::acquire_write_lock(&info_path, lu.lock_cycles(), lu.lock_factor_ms())
                .await?;

        // reload under lock, another chunk may have landed meanwhile
        let persisted = Self::load(lu, &self.upload_id).await?;
        self.offset = persisted.offset;
        if offset > self.offset {
            return Err(DcfsError::PreconditionFailed(format!(
                "upload offset gap: expected at most {}, got {}",
                self.offset, offset
            )));
        }
        if offset + data.len() as u64 > self.size {
            return Err(DcfsError::PreconditionFailed(format!(
                "upload exceeds announced size {}",
                self.size
            )));
        }

        let data_path = lu.upload_data_path(&self.upload_id);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&data_path)
            .await
            .map_err(|e| DcfsError::IoError(format!("open upload temp failed: {}", e)))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DcfsError::IoError(e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| DcfsError::IoError(format!("write chunk failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| DcfsError::IoError(e.to_string()))?;

        self.offset = self.offset.max(offset + data.len() as u64);
        self.persist(lu).await?;
        debug!("upload {} at offset {}", self.upload_id, self.offset);
        Ok(self.offset)
    }

    /// Assembly step: verifies byte count and checksum of the temp payload.
    pub async fn assemble(&self, lu: &Lookup) -> DcfsResult<String> {
        if self.offset != self.size {
            return Err(DcfsError::PreconditionFailed(format!(
                "upload incomplete: {} of {} bytes",
                self.offset, self.size
            )));
        }

        let mut hasher = Sha256::new();
        if self.size > 0 {
            let data_path = lu.upload_data_path(&self.upload_id);
            let mut file = fs::File::open(&data_path)
                .await
                .map_err(|e| DcfsError::IoError(format!("open upload temp failed: {}", e)))?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| DcfsError::IoError(e.to_string()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        let digest = hex::encode(hasher.finalize());

        if let Some(expected) = &self.checksum {
            if *expected != digest {
                return Err(DcfsError::PreconditionFailed(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }
        Ok(digest)
    }

    /// Promotes the assembled payload: streams it into the blob store, flips
    /// the node's blob attributes, clears the processing flag and propagates
    /// the size change.
    pub async fn finalize(&self, lu: &Lookup, tree: &Tree) -> DcfsResult<Node> {
        let digest = self.assemble(lu).await?;

        let mut node = Node::read(lu, &self.space_id, &self.node_id).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(format!(
                "upload target node {}",
                self.node_id
            )));
        }
        node.blob_id = self.blob_id.clone();

        if self.size > 0 {
            let data_path = lu.upload_data_path(&self.upload_id);
            let mut file = fs::File::open(&data_path)
                .await
                .map_err(|e| DcfsError::IoError(format!("open upload temp failed: {}", e)))?;
            tree.write_blob(&node, &mut file).await?;
        } else {
            let mut empty: &[u8] = &[];
            tree.write_blob(&node, &mut empty).await?;
        }

        node.set_attr(lu, BLOBID_ATTR, &self.blob_id)?;
        node.set_attr(lu, BLOBSIZE_ATTR, &self.size.to_string())?;
        node.set_attr(
            lu,
            &format!("{}sha256", CHECKSUM_PREFIX),
            &digest,
        )?;
        node.set_mtime(lu, now_nanos())?;
        node.remove_attr(lu, PROCESSING_ATTR)?;
        node.blob_size = self.size;

        if !self.previous_blob_id.is_empty() && self.previous_blob_id != self.blob_id {
            let previous = Node {
                blob_id: self.previous_blob_id.clone(),
                ..node.clone()
            };
            if let Err(e) = tree.delete_blob(&previous).await {
                // the node already points at the new blob, only space is leaked
                warn!("dropping previous blob failed: {}", e);
            }
        }

        let delta = self.size as i64 - self.previous_blob_size as i64;
        tree.propagate(&node, delta).await?;
        info!("upload {} finalized into node {}", self.upload_id, node.id);
        Ok(node)
    }

    /// Terminal cleanup. `keep_upload` leaves the temp payload for a resume;
    /// a failed session that created the placeholder takes it back out of
    /// the tree.
    pub async fn cleanup(
        &self,
        lu: &Lookup,
        tree: &Tree,
        failed: bool,
        keep_upload: bool,
    ) -> DcfsResult<()> {
        if failed && !keep_upload && !self.node_existed {
            let node = Node::read(lu, &self.space_id, &self.node_id).await?;
            if node.exists {
                let placeholder_dir = node.internal_path(lu)?;
                let link = lu.children_dir(&self.parent_id)?.join(&self.name);
                let _ = fs::remove_file(&link).await;
                let _ = fs::remove_dir_all(&placeholder_dir).await;
            }
            let _ = tree
                .delete_blob(&Node {
                    blob_id: self.blob_id.clone(),
                    space_id: self.space_id.clone(),
                    id: self.node_id.clone(),
                    parent_id: self.parent_id.clone(),
                    name: self.name.clone(),
                    blob_size: 0,
                    owner: None,
                    node_type: NodeType::File,
                    exists: true,
                })
                .await;
        } else if failed && self.node_existed {
            // overwrite failed, the previous content stays current
            let node = Node::read(lu, &self.space_id, &self.node_id).await?;
            if node.exists {
                let _ = node.remove_attr(lu, PROCESSING_ATTR);
            }
        }

        if !keep_upload {
            let _ = fs::remove_file(lu.upload_data_path(&self.upload_id)).await;
        }
        let _ = fs::remove_file(lu.upload_info_path(&self.upload_id)).await;
        let _ = fs::remove_file(filelocks::flock_path(&lu.upload_info_path(&self.upload_id))).await;
        Ok(())
    }

    /// Enumerates persisted sessions, for the startup resume scan.
    pub async fn scan(lu: &Lookup) -> DcfsResult<Vec<UploadSession>> {
        let uploads_dir = lu.uploads_dir();
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&uploads_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(DcfsError::IoError(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DcfsError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(upload_id) = name.strip_suffix(".info") else {
                continue;
            };
            match Self::load(lu, upload_id).await {
                Ok(session) => out.push(session),
                Err(e) => warn!("skipping upload session {}: {}", upload_id, e),
            }
        }
        Ok(out)
    }
}

/// Drops expired sessions, keeps live ones for event-driven completion.
/// Returns how many sessions were expired.
pub async fn resume_sessions(lu: &Lookup, tree: &Tree) -> DcfsResult<usize> {
    let now = now_secs();
    let mut expired = 0;
    for session in UploadSession::scan(lu).await? {
        if session.is_expired(now) {
            info!("expiring upload session {}", session.upload_id);
            session.cleanup(lu, tree, true, false).await?;
            expired += 1;
        } else {
            debug!(
                "upload session {} survives restart (processing: {})",
                session.upload_id, session.processing
            );
        }
    }
    Ok(expired)
}
