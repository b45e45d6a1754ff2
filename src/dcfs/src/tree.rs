use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use blob_store::{BlobReader, BlobStore};
use dcfs_lib::{new_id, DcfsError, DcfsResult};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::filelocks;
use crate::lookup::{Lookup, BY_USER_INDEX, INDEXES_DIR, NODES_DIR, SPACES_DIR, TRASH_DIR, UPLOADS_DIR};
use crate::metadata::{NAME_ATTR, PARENTID_ATTR};
use crate::node::{now_nanos, Node, NodeType};

/// One entry of a space's recycle bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecycleItem {
    pub key: String,
    pub node_id: String,
    pub parent_id: String,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    /// External path at deletion time.
    pub origin: String,
    /// Unix seconds.
    pub trashed_at: u64,
}

/// Structural mutations on the shared on-disk tree. Every operation mutates
/// under the affected parents' advisory locks and triggers propagation.
pub struct Tree {
    lu: Arc<Lookup>,
    blobstore: Arc<dyn BlobStore>,
    tree_time_accounting: bool,
    tree_size_accounting: bool,
}

impl Tree {
    pub fn new(
        lu: Arc<Lookup>,
        blobstore: Arc<dyn BlobStore>,
        tree_time_accounting: bool,
        tree_size_accounting: bool,
    ) -> Self {
        Self {
            lu,
            blobstore,
            tree_time_accounting,
            tree_size_accounting,
        }
    }

    /// Creates the top-level directory skeleton below the storage root.
    pub async fn setup(&self) -> DcfsResult<()> {
        for dir in [NODES_DIR, SPACES_DIR, UPLOADS_DIR, TRASH_DIR] {
            fs::create_dir_all(self.lu.root().join(dir))
                .await
                .map_err(|e| DcfsError::IoError(format!("setup {} failed: {}", dir, e)))?;
        }
        fs::create_dir_all(self.lu.root().join(INDEXES_DIR).join(BY_USER_INDEX))
            .await
            .map_err(|e| DcfsError::IoError(format!("setup indexes failed: {}", e)))?;
        Ok(())
    }

    fn lock_budget(&self) -> (u32, u64) {
        (self.lu.lock_cycles(), self.lu.lock_factor_ms())
    }

    async fn parent_guard(&self, parent_id: &str) -> DcfsResult<filelocks::FlockGuard> {
        let (cycles, factor) = self.lock_budget();
        filelocks::acquire_write_lock(&self.lu.node_dir(parent_id)?, cycles, factor).await
    }

    /// Materializes the node directory and base attributes. Shared by
    /// directory create, file touch and space root creation.
    pub async fn write_node_dir(&self, n: &Node) -> DcfsResult<()> {
        let dir = n.internal_path(&self.lu)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DcfsError::IoError(format!("create node dir failed: {}", e)))?;
        if n.is_dir() {
            fs::create_dir_all(n.children_path(&self.lu)?)
                .await
                .map_err(|e| DcfsError::IoError(format!("create children dir failed: {}", e)))?;
        }
        n.write_all_metadata(&self.lu)?;
        n.set_mtime(&self.lu, now_nanos())?;
        if n.is_dir() {
            n.set_tree_size(&self.lu, 0)?;
        }
        Ok(())
    }

    /// Atomically adds `name → child` to the parent's children. Fails with
    /// `AlreadyExists` on a name collision.
    async fn link_child(&self, parent_id: &str, name: &str, child_id: &str) -> DcfsResult<()> {
        let children = self.lu.children_dir(parent_id)?;
        fs::create_dir_all(&children)
            .await
            .map_err(|e| DcfsError::IoError(format!("create children dir failed: {}", e)))?;
        let link = children.join(name);
        let target = self.lu.child_link_target(child_id)?;
        match fs::symlink(&target, &link).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(DcfsError::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(DcfsError::IoError(format!(
                "link child {} failed: {}",
                name, e
            ))),
        }
    }

    async fn unlink_child(&self, parent_id: &str, name: &str) -> DcfsResult<()> {
        let link = self.lu.children_dir(parent_id)?.join(name);
        match fs::remove_file(&link).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DcfsError::IoError(format!(
                "unlink child {} failed: {}",
                name, e
            ))),
        }
    }

    /// Creates the directory node `n` and hangs it under its parent.
    pub async fn create_dir(&self, n: &Node) -> DcfsResult<()> {
        let _guard = self.parent_guard(&n.parent_id).await?;
        self.write_node_dir(n).await?;
        if let Err(e) = self.link_child(&n.parent_id, &n.name, &n.id).await {
            // roll the orphaned node directory back out
            let _ = fs::remove_dir_all(n.internal_path(&self.lu)?).await;
            return Err(e);
        }
        drop(_guard);
        self.propagate(n, 0).await
    }

    /// Creates a zero-length file node; uploads replace its blob later.
    /// `processing` marks the node as owned by an active upload session.
    pub async fn touch_file(&self, n: &Node, processing: Option<&str>) -> DcfsResult<()> {
        let _guard = self.parent_guard(&n.parent_id).await?;
        self.write_node_dir(n).await?;
        if let Some(upload_id) = processing {
            n.set_attr(&self.lu, crate::metadata::PROCESSING_ATTR, upload_id)?;
        }
        if let Err(e) = self.link_child(&n.parent_id, &n.name, &n.id).await {
            let _ = fs::remove_dir_all(n.internal_path(&self.lu)?).await;
            return Err(e);
        }
        drop(_guard);
        self.propagate(n, 0).await
    }

    /// Moves/renames `old` to the location described by `new` (same space).
    /// Parent locks are taken in lexicographic node-id order so concurrent
    /// moves cannot deadlock.
    pub async fn move_node(&self, old: &Node, new: &Node) -> DcfsResult<()> {
        if old.space_id != new.space_id {
            return Err(DcfsError::NotSupported("cross-space move".to_string()));
        }
        let mut parents = vec![old.parent_id.clone(), new.parent_id.clone()];
        parents.sort();
        parents.dedup();
        let mut guards = Vec::new();
        for pid in &parents {
            guards.push(self.parent_guard(pid).await?);
        }

        // re-check the destination under lock; rename(2) would silently
        // replace an existing link
        let dst = self.lu.children_dir(&new.parent_id)?.join(&new.name);
        if fs::symlink_metadata(&dst).await.is_ok() {
            return Err(DcfsError::AlreadyExists(new.name.clone()));
        }

        let src = self.lu.children_dir(&old.parent_id)?.join(&old.name);
        fs::rename(&src, &dst)
            .await
            .map_err(|e| DcfsError::IoError(format!("rename child link failed: {}", e)))?;

        if old.parent_id != new.parent_id {
            old.set_attr(&self.lu, PARENTID_ATTR, &new.parent_id)?;
        }
        if old.name != new.name {
            old.set_attr(&self.lu, NAME_ATTR, &new.name)?;
        }
        drop(guards);

        let size = old.subtree_size(&self.lu)? as i64;
        if old.parent_id != new.parent_id {
            self.propagate_from(&old.space_id, &old.parent_id, -size)
                .await?;
            self.propagate_from(&new.space_id, &new.parent_id, size)
                .await?;
        } else {
            self.propagate_from(&old.space_id, &old.parent_id, 0).await?;
        }
        Ok(())
    }

    /// Moves `n` to the space's recycle bin, returns the recycle key. The
    /// node directory is renamed in place inside its shard so descendant
    /// links stay intact; the trash index points at the renamed directory.
    pub async fn delete(&self, n: &Node, origin: &str) -> DcfsResult<String> {
        let key = new_id();
        let size = n.subtree_size(&self.lu)?;

        let trash_dir = self.lu.trash_dir(&n.space_id);
        fs::create_dir_all(&trash_dir)
            .await
            .map_err(|e| DcfsError::IoError(format!("create trash dir failed: {}", e)))?;

        let item = RecycleItem {
            key: key.clone(),
            node_id: n.id.clone(),
            parent_id: n.parent_id.clone(),
            name: n.name.clone(),
            node_type: n.node_type,
            size,
            origin: origin.to_string(),
            trashed_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let info = serde_json::to_string(&item).map_err(|e| DcfsError::Internal(e.to_string()))?;
        fs::write(self.lu.trash_info_path(&n.space_id, &key), info)
            .await
            .map_err(|e| DcfsError::IoError(format!("write trash stub failed: {}", e)))?;

        let _guard = self.parent_guard(&n.parent_id).await?;

        // a passed CheckLock means any remaining lock sidecar is stale
        let _ = fs::remove_file(n.lock_file_path(&self.lu)?).await;

        fs::rename(
            n.internal_path(&self.lu)?,
            self.lu.trashed_node_dir(&n.id, &key)?,
        )
        .await
        .map_err(|e| DcfsError::IoError(format!("move to trash failed: {}", e)))?;

        fs::symlink(
            self.lu.trash_link_target(&n.id, &key)?,
            self.lu.trash_link_path(&n.space_id, &key),
        )
        .await
        .map_err(|e| DcfsError::IoError(format!("trash link failed: {}", e)))?;

        self.unlink_child(&n.parent_id, &n.name).await?;
        drop(_guard);

        self.propagate_from(&n.space_id, &n.parent_id, -(size as i64))
            .await?;
        Ok(key)
    }

    pub async fn read_recycle_item(&self, space_id: &str, key: &str) -> DcfsResult<RecycleItem> {
        let info_path = self.lu.trash_info_path(space_id, key);
        let json = fs::read_to_string(&info_path)
            .await
            .map_err(|_| DcfsError::NotFound(format!("trash entry {}", key)))?;
        serde_json::from_str(&json)
            .map_err(|e| DcfsError::Internal(format!("corrupt trash stub {}: {}", key, e)))
    }

    pub async fn list_recycle(&self, space_id: &str) -> DcfsResult<Vec<RecycleItem>> {
        let trash_dir = self.lu.trash_dir(space_id);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&trash_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(DcfsError::IoError(format!("read trash failed: {}", e))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DcfsError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(key) = name.strip_suffix(".info") else {
                continue;
            };
            match self.read_recycle_item(space_id, key).await {
                Ok(item) => out.push(item),
                Err(e) => warn!("skipping trash entry {}: {}", key, e),
            }
        }
        out.sort_by(|a, b| a.trashed_at.cmp(&b.trashed_at));
        Ok(out)
    }

    /// Restores a recycle entry, by default to its former parent and name.
    /// Fails with `PreconditionFailed` when the target parent is gone and
    /// `AlreadyExists` on a name collision.
    pub async fn restore_recycle_item(
        &self,
        space_id: &str,
        key: &str,
        target: Option<(&Node, &str)>,
    ) -> DcfsResult<Node> {
        let item = self.read_recycle_item(space_id, key).await?;
        let trashed = Node::read_trashed(&self.lu, space_id, &item.node_id, key).await?;

        let (parent, name): (Node, String) = match target {
            Some((parent, name)) => (parent.clone(), name.to_string()),
            None => {
                let parent = Node::read(&self.lu, space_id, &item.parent_id).await?;
                (parent, item.name.clone())
            }
        };
        if !parent.exists {
            return Err(DcfsError::PreconditionFailed(format!(
                "restore target parent {} is gone",
                item.parent_id
            )));
        }

        let _guard = self.parent_guard(&parent.id).await?;
        let link = self.lu.children_dir(&parent.id)?.join(&name);
        if fs::symlink_metadata(&link).await.is_ok() {
            return Err(DcfsError::AlreadyExists(name));
        }

        fs::rename(
            self.lu.trashed_node_dir(&item.node_id, key)?,
            self.lu.node_dir(&item.node_id)?,
        )
        .await
        .map_err(|e| DcfsError::IoError(format!("restore rename failed: {}", e)))?;

        let mut restored = trashed;
        restored.parent_id = parent.id.clone();
        restored.name = name.clone();
        restored.set_attr(&self.lu, PARENTID_ATTR, &parent.id)?;
        restored.set_attr(&self.lu, NAME_ATTR, &name)?;

        self.link_child(&parent.id, &name, &item.node_id).await?;
        let _ = fs::remove_file(self.lu.trash_link_path(space_id, key)).await;
        let _ = fs::remove_file(self.lu.trash_info_path(space_id, key)).await;
        drop(_guard);

        self.propagate_from(space_id, &parent.id, item.size as i64)
            .await?;
        Ok(restored)
    }

    /// Permanently removes a recycle entry and its blobs.
    pub async fn purge_recycle_item(&self, space_id: &str, key: &str) -> DcfsResult<RecycleItem> {
        let item = self.read_recycle_item(space_id, key).await?;
        let trashed_dir = self.lu.trashed_node_dir(&item.node_id, key)?;
        let root = Node::read_trashed(&self.lu, space_id, &item.node_id, key).await?;

        self.purge_node_recursive(&root, &trashed_dir).await?;

        let _ = fs::remove_file(self.lu.trash_link_path(space_id, key)).await;
        fs::remove_file(self.lu.trash_info_path(space_id, key))
            .await
            .map_err(|e| DcfsError::IoError(format!("remove trash stub failed: {}", e)))?;
        Ok(item)
    }

    /// Depth-first blob + node-directory removal. The subtree's directories
    /// are scattered across shards, so each one is dropped individually.
    fn purge_node_recursive<'a>(
        &'a self,
        node: &'a Node,
        dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = DcfsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if node.is_dir() {
                let children = dir.join(crate::lookup::CHILDREN_DIR);
                if let Ok(mut entries) = fs::read_dir(&children).await {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let Ok(target) = fs::read_link(entry.path()).await else {
                            continue;
                        };
                        let Some(child_id) = self.lu.node_id_from_link_target(&target) else {
                            continue;
                        };
                        let child = Node::read(&self.lu, &node.space_id, &child_id).await?;
                        if !child.exists {
                            continue;
                        }
                        let child_dir = self.lu.node_dir(&child_id)?;
                        self.purge_node_recursive(&child, &child_dir).await?;
                    }
                }
            } else if !node.blob_id.is_empty() {
                self.blobstore.delete(&node.blob_id).await?;
            }
            fs::remove_dir_all(dir)
                .await
                .map_err(|e| DcfsError::IoError(format!("purge {} failed: {}", dir.display(), e)))?;
            debug!("purged node {}", node.id);
            Ok(())
        })
    }

    /// Enumerates a directory's children, silently dropping broken links.
    pub async fn list_folder(&self, n: &Node) -> DcfsResult<Vec<Node>> {
        if !n.is_dir() {
            return Err(DcfsError::PreconditionFailed(format!(
                "{} is not a directory",
                n.id
            )));
        }
        let children_dir = n.children_path(&self.lu)?;
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&children_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(DcfsError::IoError(format!("list failed: {}", e))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DcfsError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let child = n.child(&self.lu, &name).await?;
            if child.exists {
                out.push(child);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Propagates a subtree change to the ancestors of `n`.
    pub async fn propagate(&self, n: &Node, size_delta: i64) -> DcfsResult<()> {
        self.propagate_from(&n.space_id, &n.parent_id, size_delta)
            .await
    }

    /// Walks from the given ancestor to the space root. Each ancestor is
    /// updated under its own advisory lock, child-to-root order; tmtime is
    /// monotone (max of current and now) so concurrent propagations are
    /// idempotent. An ancestor carrying the propagation sentinel ends the
    /// walk.
    pub async fn propagate_from(
        &self,
        space_id: &str,
        start_id: &str,
        size_delta: i64,
    ) -> DcfsResult<()> {
        if !self.tree_time_accounting && !self.tree_size_accounting {
            return Ok(());
        }
        let (cycles, factor) = self.lock_budget();
        let mut current_id = start_id.to_string();
        while !current_id.is_empty() {
            let node = Node::read(&self.lu, space_id, &current_id).await?;
            if !node.exists {
                warn!("propagation hit missing ancestor {}", current_id);
                break;
            }
            if node.has_propagation_sentinel(&self.lu)? {
                debug!("propagation stopped at sentinel {}", current_id);
                break;
            }

            let dir = node.internal_path(&self.lu)?;
            let guard = filelocks::acquire_write_lock(&dir, cycles, factor).await?;
            if self.tree_time_accounting {
                let now = now_nanos();
                if now > node.get_tmtime(&self.lu)? {
                    node.set_tmtime(&self.lu, now)?;
                }
            }
            if self.tree_size_accounting && size_delta != 0 {
                let current = node.get_tree_size(&self.lu)?;
                let updated = if size_delta < 0 {
                    current.saturating_sub(size_delta.unsigned_abs())
                } else {
                    current.saturating_add(size_delta as u64)
                };
                node.set_tree_size(&self.lu, updated)?;
            }
            drop(guard);

            if node.is_space_root() {
                break;
            }
            current_id = node.parent_id;
        }
        Ok(())
    }

    pub async fn write_blob(
        &self,
        n: &Node,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> DcfsResult<u64> {
        if n.blob_id.is_empty() {
            return Err(DcfsError::PreconditionFailed(format!(
                "{} has no blob id",
                n.id
            )));
        }
        self.blobstore.put(&n.blob_id, reader).await
    }

    pub async fn read_blob(&self, n: &Node) -> DcfsResult<BlobReader> {
        if n.blob_id.is_empty() {
            return Err(DcfsError::PreconditionFailed(format!(
                "{} has no blob id",
                n.id
            )));
        }
        self.blobstore.get(&n.blob_id).await
    }

    pub async fn delete_blob(&self, n: &Node) -> DcfsResult<()> {
        if n.blob_id.is_empty() {
            return Ok(());
        }
        self.blobstore.delete(&n.blob_id).await
    }

    /// Re-derives tree size and tmtime bottom-up for one space, repairing
    /// the accounting after interrupted propagations. Returns the number of
    /// directories fixed.
    pub async fn reconcile_space(&self, space_id: &str) -> DcfsResult<usize> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        let mut fixed = 0;
        self.reconcile_dir(&root, &mut fixed).await?;
        Ok(fixed)
    }

    fn reconcile_dir<'a>(
        &'a self,
        node: &'a Node,
        fixed: &'a mut usize,
    ) -> Pin<Box<dyn Future<Output = DcfsResult<(u64, u64)>> + Send + 'a>> {
        Box::pin(async move {
            if !node.is_dir() {
                return Ok((node.blob_size, node.get_tmtime(&self.lu)?));
            }
            let mut size_sum = 0u64;
            let mut max_tmtime = node.get_mtime(&self.lu)?;
            for child in self.list_folder(node).await? {
                let (child_size, child_tmtime) = self.reconcile_dir(&child, fixed).await?;
                size_sum += child_size;
                max_tmtime = max_tmtime.max(child_tmtime);
            }

            let dir = node.internal_path(&self.lu)?;
            let (cycles, factor) = self.lock_budget();
            let guard = filelocks::acquire_write_lock(&dir, cycles, factor).await?;
            let mut dirty = false;
            if self.tree_size_accounting && node.get_tree_size(&self.lu)? != size_sum {
                node.set_tree_size(&self.lu, size_sum)?;
                dirty = true;
            }
            if self.tree_time_accounting && node.get_tmtime(&self.lu)? < max_tmtime {
                node.set_tmtime(&self.lu, max_tmtime)?;
                dirty = true;
            }
            drop(guard);
            if dirty {
                *fixed += 1;
                debug!("reconciled {} (size {}, tmtime {})", node.id, size_sum, max_tmtime);
            }
            Ok((size_sum, node.get_tmtime(&self.lu)?))
        })
    }
}
