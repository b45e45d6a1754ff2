use std::sync::Arc;
use std::time::Duration;

use blob_store::{BlobReader, BlobStore};
use dcfs_lib::{
    DcfsError, DcfsResult, Event, EventStream, LockInfo, PermissionSet, PermissionsChecker,
    PostprocessingOutcome, Reference, RequestContext, ResourceId,
};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache::StatCache;
use crate::config::{DcfsConfig, MetadataBackendKind};
use crate::lookup::Lookup;
use crate::metadata::{MetadataBackend, SidecarBackend, XattrsBackend};
use crate::node::{Node, NodeType, ResourceInfo};
use crate::spaces::{SpaceFilter, SpaceManager, SpacePatch, StorageSpace};
use crate::tree::{RecycleItem, Tree};
use crate::upload::{self, UploadSession};

/// Options accepted by [`Decomposedfs::initiate_upload`].
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Expected SHA-256 hex digest of the final payload.
    pub checksum: Option<String>,
    /// Unix seconds after which the session expires.
    pub expiration: Option<u64>,
}

/// Entry point of the storage core. Every write follows the same pipeline:
/// resolve, assemble permissions, check lock, delegate, propagate,
/// invalidate the stat cache, publish the lifecycle event.
pub struct Decomposedfs {
    config: DcfsConfig,
    lu: Arc<Lookup>,
    tree: Arc<Tree>,
    spaces: SpaceManager,
    permissions: Arc<dyn PermissionsChecker>,
    stream: Arc<dyn EventStream>,
    cache: StatCache,
    cancel: CancellationToken,
}

impl Decomposedfs {
    pub async fn new(
        config: DcfsConfig,
        blobstore: Arc<dyn BlobStore>,
        permissions: Arc<dyn PermissionsChecker>,
        stream: Arc<dyn EventStream>,
    ) -> DcfsResult<Arc<Self>> {
        let metadata: Arc<dyn MetadataBackend> = match config.metadata_backend {
            MetadataBackendKind::Xattrs => Arc::new(XattrsBackend),
            MetadataBackendKind::Sidecar => Arc::new(SidecarBackend),
        };
        let lu = Arc::new(Lookup::new(
            config.root.clone(),
            metadata,
            config.max_acquire_lock_cycles,
            config.lock_cycle_duration_factor_ms,
        ));
        let tree = Arc::new(Tree::new(
            Arc::clone(&lu),
            blobstore,
            config.tree_time_accounting,
            config.tree_size_accounting,
        ));
        tree.setup().await?;

        let expired = upload::resume_sessions(&lu, &tree).await?;
        if expired > 0 {
            info!("expired {} stale upload sessions on startup", expired);
        }

        let spaces = SpaceManager::new(
            Arc::clone(&lu),
            Arc::clone(&tree),
            config.personal_space_quota,
        );
        let cache = StatCache::new(Duration::from_secs(config.stat_cache_ttl_secs));

        let fs = Arc::new(Self {
            lu,
            tree,
            spaces,
            permissions,
            stream,
            cache,
            cancel: CancellationToken::new(),
            config,
        });

        if fs.config.async_file_uploads {
            fs.spawn_postprocessing_workers();
        }
        if fs.config.reconciler_interval_secs > 0 {
            fs.spawn_reconciler();
        }
        Ok(fs)
    }

    /// Stops the worker pool and the reconciler.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lu
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    // ---- permission plumbing -------------------------------------------

    /// Collects the node's (or, for a not-yet-existing node, its parent's)
    /// grant chain up to the space root and lets the policy collaborator
    /// turn it into an effective permission set.
    async fn assemble_permissions(
        &self,
        ctx: &RequestContext,
        node: &Node,
    ) -> DcfsResult<PermissionSet> {
        let mut grants = Vec::new();
        let mut current = if node.exists {
            node.clone()
        } else if !node.parent_id.is_empty() {
            Node::read(&self.lu, &node.space_id, &node.parent_id).await?
        } else {
            Node::read(&self.lu, &node.space_id, &node.space_id).await?
        };
        loop {
            if current.exists {
                grants.extend(current.grants(&self.lu)?);
            }
            if !current.exists || current.is_space_root() || current.parent_id.is_empty() {
                break;
            }
            current = Node::read(&self.lu, &current.space_id, &current.parent_id).await?;
        }

        let root = Node::read(&self.lu, &node.space_id, &node.space_id).await?;
        let owner = root.owner.clone().or_else(|| node.owner.clone());
        self.permissions
            .assemble_permissions(ctx, owner.as_ref(), &grants)
            .await
    }

    /// Denials become `NotFound` unless the caller may stat the resource,
    /// so denied references are indistinguishable from missing ones.
    fn denial(reference: impl std::fmt::Display, perms: &PermissionSet) -> DcfsError {
        if perms.stat {
            DcfsError::PermissionDenied(reference.to_string())
        } else {
            DcfsError::NotFound(reference.to_string())
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.stream.publish(event).await {
            warn!("event publish failed: {}", e);
        }
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    // ---- directories and files -----------------------------------------

    /// Creates the directory the reference points at; its parent must exist.
    pub async fn create_dir(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> DcfsResult<ResourceId> {
        let (parent_ref, name) = reference.split_parent()?;
        let parent = self.lu.node_from_resource(&parent_ref).await?;
        if !parent.exists {
            return Err(DcfsError::PreconditionFailed(parent_ref.to_string()));
        }

        let perms = self.assemble_permissions(ctx, &parent).await?;
        if !perms.create_container {
            return Err(Self::denial(reference, &perms));
        }
        parent.check_lock(&self.lu, ctx).await?;

        let child = parent.child(&self.lu, &name).await?;
        if child.exists {
            return Err(DcfsError::AlreadyExists(reference.to_string()));
        }

        let node = Node::new(
            &parent.space_id,
            "",
            &parent.id,
            &name,
            NodeType::Dir,
            0,
            "",
            Some(ctx.user.id.clone()),
        );
        self.tree.create_dir(&node).await?;

        self.cache.remove(&parent.resource_id());
        self.publish(Event::ItemCreated {
            resource_id: node.resource_id(),
            executing_user: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(node.resource_id())
    }

    /// Creates a zero-length file node, the placeholder uploads build upon.
    pub async fn touch_file(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> DcfsResult<ResourceId> {
        let (parent_ref, name) = reference.split_parent()?;
        let parent = self.lu.node_from_resource(&parent_ref).await?;
        if !parent.exists {
            return Err(DcfsError::NotFound(parent_ref.to_string()));
        }

        let perms = self.assemble_permissions(ctx, &parent).await?;
        if !perms.initiate_file_upload {
            return Err(Self::denial(reference, &perms));
        }
        parent.check_lock(&self.lu, ctx).await?;

        let node = Node::new(
            &parent.space_id,
            "",
            &parent.id,
            &name,
            NodeType::File,
            0,
            "",
            Some(ctx.user.id.clone()),
        );
        self.tree.touch_file(&node, None).await?;

        self.cache.remove(&parent.resource_id());
        self.publish(Event::ItemCreated {
            resource_id: node.resource_id(),
            executing_user: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(node.resource_id())
    }

    /// Moves/renames within one space; cross-space moves are rejected.
    pub async fn move_node(
        &self,
        ctx: &RequestContext,
        old_ref: &Reference,
        new_ref: &Reference,
    ) -> DcfsResult<()> {
        let old = self.lu.node_from_resource(old_ref).await?;
        if !old.exists {
            return Err(DcfsError::NotFound(old_ref.to_string()));
        }
        if old.is_space_root() {
            return Err(DcfsError::BadRequest("cannot move a space root".to_string()));
        }
        let old_perms = self.assemble_permissions(ctx, &old).await?;
        if !old_perms.move_resource {
            return Err(Self::denial(old_ref, &old_perms));
        }

        let new = self.lu.node_from_resource(new_ref).await?;
        if new.exists {
            return Err(DcfsError::AlreadyExists(new_ref.to_string()));
        }
        if new.parent_id.is_empty() {
            return Err(DcfsError::PreconditionFailed(format!(
                "move target parent missing: {}",
                new_ref
            )));
        }
        if old.space_id != new.space_id {
            return Err(DcfsError::NotSupported("cross-space move".to_string()));
        }
        let new_perms = self.assemble_permissions(ctx, &new).await?;
        let allowed = if old.is_dir() {
            new_perms.create_container
        } else {
            new_perms.initiate_file_upload
        };
        if !allowed {
            return Err(Self::denial(new_ref, &new_perms));
        }

        old.check_lock(&self.lu, ctx).await?;
        new.check_lock(&self.lu, ctx).await?;

        self.tree.move_node(&old, &new).await?;

        self.cache.remove(&old.resource_id());
        self.cache
            .remove(&ResourceId::new(&old.space_id, &old.parent_id));
        self.cache
            .remove(&ResourceId::new(&new.space_id, &new.parent_id));
        self.publish(Event::ItemMoved {
            resource_id: old.resource_id(),
            executing_user: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(())
    }

    /// Moves the referenced node to the space's recycle bin, returns the
    /// recycle key.
    pub async fn delete(&self, ctx: &RequestContext, reference: &Reference) -> DcfsResult<String> {
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        if node.is_space_root() {
            // spaces are disabled, never deleted through the tree
            return Err(DcfsError::PermissionDenied(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.delete {
            return Err(Self::denial(reference, &perms));
        }
        node.check_lock(&self.lu, ctx).await?;

        let origin = self.lu.path(&node, |_| async { true }).await?;
        let key = self.tree.delete(&node, &origin).await?;

        self.cache.remove(&node.resource_id());
        self.publish(Event::ItemTrashed {
            resource_id: node.resource_id(),
            recycle_key: key.clone(),
            executing_user: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(key)
    }

    /// Metadata of the referenced resource.
    pub async fn get_md(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> DcfsResult<ResourceInfo> {
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.stat {
            // no existence oracle for stat itself
            return Err(DcfsError::NotFound(reference.to_string()));
        }

        let user_key = &ctx.user.id.opaque_id;
        if let Some(cached) = self.cache.get(user_key, &node.resource_id()) {
            debug!("stat cache hit for {}", node.id);
            return Ok(cached);
        }
        let info = node.as_resource_info(&self.lu, &perms).await?;
        self.cache.insert(user_key, info.clone());
        Ok(info)
    }

    /// Lists a directory. Broken child links are skipped, not surfaced.
    pub async fn list_folder(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> DcfsResult<Vec<ResourceInfo>> {
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.list_container {
            return Err(Self::denial(reference, &perms));
        }

        let children = self.tree.list_folder(&node).await?;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            out.push(child.as_resource_info(&self.lu, &perms).await?);
        }
        Ok(out)
    }

    /// Streams the blob of a file node.
    pub async fn download(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> DcfsResult<BlobReader> {
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.initiate_file_download {
            return Err(Self::denial(reference, &perms));
        }
        if node.is_dir() {
            return Err(DcfsError::BadRequest(format!(
                "{} is a directory",
                reference
            )));
        }
        self.tree.read_blob(&node).await
    }

    /// External path of a node, masked at the first ancestor the caller may
    /// not see.
    pub async fn get_path_by_id(
        &self,
        ctx: &RequestContext,
        resource_id: &ResourceId,
    ) -> DcfsResult<String> {
        let node = self.lu.node_from_id(resource_id).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(format!(
                "{}!{}",
                resource_id.storage_id, resource_id.opaque_id
            )));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.get_path {
            return Err(Self::denial(&resource_id.opaque_id, &perms));
        }

        self.lu
            .path(&node, |ancestor| async move {
                self.assemble_permissions(ctx, &ancestor)
                    .await
                    .map(|p| p.get_path)
                    .unwrap_or(false)
            })
            .await
    }

    pub async fn create_reference(
        &self,
        _ctx: &RequestContext,
        _path: &str,
        _target: &str,
    ) -> DcfsResult<()> {
        Err(DcfsError::NotSupported("create reference".to_string()))
    }

    // ---- locks ----------------------------------------------------------

    pub async fn get_lock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> DcfsResult<LockInfo> {
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.initiate_file_download {
            return Err(Self::denial(reference, &perms));
        }
        node.read_lock(&self.lu)
            .await?
            .ok_or_else(|| DcfsError::NotFound(format!("no lock on {}", reference)))
    }

    pub async fn set_lock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        lock: &LockInfo,
    ) -> DcfsResult<()> {
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.initiate_file_upload {
            return Err(Self::denial(reference, &perms));
        }

        node.set_lock(&self.lu, ctx, lock).await?;
        self.cache.remove(&node.resource_id());
        self.publish(Event::FileLocked {
            resource_id: node.resource_id(),
            lock_id: lock.lock_id.clone(),
            executing_user: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(())
    }

    pub async fn refresh_lock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        lock: &LockInfo,
        existing_lock_id: Option<&str>,
    ) -> DcfsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(DcfsError::BadRequest("missing lock id".to_string()));
        }
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.initiate_file_upload {
            return Err(Self::denial(reference, &perms));
        }
        node.refresh_lock(&self.lu, ctx, lock, existing_lock_id).await
    }

    pub async fn unlock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        lock: &LockInfo,
    ) -> DcfsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(DcfsError::BadRequest("missing lock id".to_string()));
        }
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.initiate_file_upload {
            return Err(Self::denial(reference, &perms));
        }

        node.unlock(&self.lu, ctx, lock).await?;
        self.cache.remove(&node.resource_id());
        self.publish(Event::FileUnlocked {
            resource_id: node.resource_id(),
            executing_user: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(())
    }

    // ---- uploads --------------------------------------------------------

    /// Reserves an upload session targeting the referenced (possibly
    /// not-yet-existing) file. The placeholder node appears immediately,
    /// flagged as processing.
    pub async fn initiate_upload(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        size: u64,
        opts: UploadOptions,
    ) -> DcfsResult<String> {
        let (parent_ref, name) = reference.split_parent()?;
        let parent = self.lu.node_from_resource(&parent_ref).await?;
        if !parent.exists {
            return Err(DcfsError::PreconditionFailed(parent_ref.to_string()));
        }

        let target = parent.child(&self.lu, &name).await?;
        let perms = self.assemble_permissions(ctx, &target).await?;
        if !perms.initiate_file_upload {
            return Err(Self::denial(reference, &perms));
        }
        if target.exists {
            if target.is_dir() {
                return Err(DcfsError::PreconditionFailed(format!(
                    "{} is a directory",
                    reference
                )));
            }
            target.check_lock(&self.lu, ctx).await?;
        }

        let delta = size.saturating_sub(if target.exists { target.blob_size } else { 0 });
        self.spaces.check_quota(&parent.space_id, delta).await?;

        let parent_path = self.lu.path(&parent, |_| async { true }).await?;
        let path = if parent_path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent_path, name)
        };

        let session = UploadSession::initiate(
            &self.lu,
            &self.tree,
            &ctx.user,
            &parent,
            &target,
            &name,
            &path,
            size,
            opts.checksum,
            opts.expiration,
        )
        .await?;

        self.cache.remove(&parent.resource_id());
        Ok(session.upload_id)
    }

    /// Appends/patches bytes at `offset`, returns the new session offset.
    pub async fn upload_chunk(
        &self,
        _ctx: &RequestContext,
        upload_id: &str,
        offset: u64,
        data: &[u8],
    ) -> DcfsResult<u64> {
        let mut session = UploadSession::load(&self.lu, upload_id).await?;
        session.write_chunk(&self.lu, offset, data).await
    }

    /// Ends the write phase. With synchronous uploads the blob is promoted
    /// immediately and the resource info returned; with asynchronous
    /// uploads the session parks in the processing state until the
    /// post-processing outcome arrives, and `None` is returned.
    pub async fn finalize_upload(
        &self,
        ctx: &RequestContext,
        upload_id: &str,
    ) -> DcfsResult<Option<ResourceInfo>> {
        let mut session = UploadSession::load(&self.lu, upload_id).await?;

        if self.config.async_file_uploads {
            session.assemble(&self.lu).await?;
            session.processing = true;
            session.persist(&self.lu).await?;
            debug!("upload {} assembled, awaiting post-processing", upload_id);
            return Ok(None);
        }

        let node = session.finalize(&self.lu, &self.tree).await?;
        session.cleanup(&self.lu, &self.tree, false, false).await?;

        self.cache.remove(&node.resource_id());
        self.cache
            .remove(&ResourceId::new(&node.space_id, &session.parent_id));
        self.publish(Event::UploadReady {
            upload_id: upload_id.to_string(),
            failed: false,
            executing_user: ctx.user.id.clone(),
            file_ref: Reference::space_path(&node.space_id, session.path.clone()),
            space_owner: node.space_owner_or_manager(&self.lu).await?,
            timestamp: Self::now_secs(),
        })
        .await;

        let perms = self.assemble_permissions(ctx, &node).await?;
        Ok(Some(node.as_resource_info(&self.lu, &perms).await?))
    }

    // ---- spaces and quota ----------------------------------------------

    pub async fn create_space(
        &self,
        ctx: &RequestContext,
        space_type: &str,
        name: &str,
        quota_bytes: Option<u64>,
    ) -> DcfsResult<StorageSpace> {
        let space = self
            .spaces
            .create_space(ctx, space_type, name, quota_bytes)
            .await?;
        self.publish(Event::SpaceCreated {
            space_id: space.id.clone(),
            space_type: space.space_type.clone(),
            owner: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(space)
    }

    /// Spaces the caller owns or may at least stat.
    pub async fn list_spaces(
        &self,
        ctx: &RequestContext,
        filter: &SpaceFilter,
    ) -> DcfsResult<Vec<StorageSpace>> {
        let mut out = Vec::new();
        for space in self.spaces.list_spaces(filter).await? {
            if space.owner.as_ref() == Some(&ctx.user.id) {
                out.push(space);
                continue;
            }
            let root = Node::read(&self.lu, &space.id, &space.id).await?;
            let perms = self.assemble_permissions(ctx, &root).await?;
            if perms.stat {
                out.push(space);
            }
        }
        Ok(out)
    }

    /// Owner/manager-only mutation of a space's name, description, quota or
    /// disabled flag.
    pub async fn update_space(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        patch: &SpacePatch,
    ) -> DcfsResult<StorageSpace> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        let perms = self.assemble_permissions(ctx, &root).await?;
        let is_owner = root.owner.as_ref() == Some(&ctx.user.id);
        if !is_owner && !perms.is_manager() {
            return Err(Self::denial(space_id, &perms));
        }

        let space = self.spaces.update_space(ctx, space_id, patch).await?;
        self.cache.remove(&ResourceId::space_root(space_id));
        if patch.disabled == Some(true) {
            self.publish(Event::SpaceDisabled {
                space_id: space_id.to_string(),
                executing_user: ctx.user.id.clone(),
                timestamp: Self::now_secs(),
            })
            .await;
        } else {
            self.publish(Event::SpaceUpdated {
                space_id: space_id.to_string(),
                executing_user: ctx.user.id.clone(),
                timestamp: Self::now_secs(),
            })
            .await;
        }
        Ok(space)
    }

    /// `(total, in_use, remaining)` of the space the reference points into.
    pub async fn get_quota(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> DcfsResult<(u64, u64, u64)> {
        let node = self.lu.node_from_resource(reference).await?;
        if !node.exists {
            return Err(DcfsError::NotFound(reference.to_string()));
        }
        let perms = self.assemble_permissions(ctx, &node).await?;
        if !perms.get_quota {
            return Err(Self::denial(reference, &perms));
        }
        self.spaces.quota_usage(&node.space_id).await
    }

    // ---- recycle bin ----------------------------------------------------

    pub async fn list_recycle(
        &self,
        ctx: &RequestContext,
        space_id: &str,
    ) -> DcfsResult<Vec<RecycleItem>> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        let perms = self.assemble_permissions(ctx, &root).await?;
        if !perms.list_recycle {
            return Err(Self::denial(space_id, &perms));
        }
        self.tree.list_recycle(space_id).await
    }

    /// Restores a recycle entry, optionally to a different parent/name.
    pub async fn restore_recycle_item(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        key: &str,
        restore_ref: Option<&Reference>,
    ) -> DcfsResult<ResourceId> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        let perms = self.assemble_permissions(ctx, &root).await?;
        if !perms.restore_recycle_item {
            return Err(Self::denial(space_id, &perms));
        }

        let restored = match restore_ref {
            Some(reference) => {
                let (parent_ref, name) = reference.split_parent()?;
                let parent = self.lu.node_from_resource(&parent_ref).await?;
                if !parent.exists {
                    return Err(DcfsError::PreconditionFailed(parent_ref.to_string()));
                }
                self.tree
                    .restore_recycle_item(space_id, key, Some((&parent, &name)))
                    .await?
            }
            None => self.tree.restore_recycle_item(space_id, key, None).await?,
        };

        self.cache.remove(&restored.resource_id());
        Ok(restored.resource_id())
    }

    /// Permanently removes a recycle entry including its blobs.
    pub async fn purge_recycle_item(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        key: &str,
    ) -> DcfsResult<()> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        let perms = self.assemble_permissions(ctx, &root).await?;
        if !perms.purge_recycle {
            return Err(Self::denial(space_id, &perms));
        }

        let item = self.tree.purge_recycle_item(space_id, key).await?;
        self.publish(Event::ItemPurged {
            resource_id: ResourceId::new(space_id, &item.node_id),
            executing_user: ctx.user.id.clone(),
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(())
    }

    // ---- post-processing worker pool ------------------------------------

    /// One pump forwards PostprocessingFinished events from the stream into
    /// a work queue; a fixed pool of workers drains it. Every event is
    /// processed to completion; soft failures are logged and acknowledged
    /// so redelivery stays bounded.
    fn spawn_postprocessing_workers(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel::<Event>(64);
        let rx = Arc::new(Mutex::new(rx));

        let mut subscription = self.stream.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = subscription.recv() => match received {
                        Ok(event @ Event::PostprocessingFinished { .. }) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("post-processing pump lagged, {} events dropped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        for worker in 0..self.config.postprocessing_workers.max(1) {
            let fs = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                debug!("post-processing worker {} up", worker);
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            event = rx.recv() => event,
                        }
                    };
                    let Some(event) = event else { break };
                    if let Err(e) = fs.handle_postprocessing_event(event).await {
                        error!("post-processing worker {}: {}", worker, e);
                    }
                }
                debug!("post-processing worker {} down", worker);
            });
        }
    }

    async fn handle_postprocessing_event(&self, event: Event) -> DcfsResult<()> {
        let Event::PostprocessingFinished {
            upload_id,
            outcome,
            executing_user,
        } = event
        else {
            return Ok(());
        };

        let session = match UploadSession::load(&self.lu, &upload_id).await {
            Ok(s) => s,
            Err(e) => {
                // without the session neither blob nor node can be cleaned
                warn!("upload {} gone at post-processing: {}", upload_id, e);
                return Ok(());
            }
        };

        let (failed, keep_upload) = match outcome {
            PostprocessingOutcome::Continue => {
                let delta = session.size.saturating_sub(session.previous_blob_size);
                let promoted = match self.spaces.check_quota(&session.space_id, delta).await {
                    Ok(()) => session.finalize(&self.lu, &self.tree).await,
                    Err(e) => Err(e),
                };
                match promoted {
                    Ok(_) => (false, false),
                    Err(e) => {
                        warn!("upload {} finalize failed: {}", upload_id, e);
                        (true, true)
                    }
                }
            }
            PostprocessingOutcome::Abort | PostprocessingOutcome::Unknown => (true, true),
            PostprocessingOutcome::Delete => (true, false),
        };

        // refresh the parent etag regardless of outcome so clients re-stat
        if let Err(e) = self
            .tree
            .propagate_from(&session.space_id, &session.parent_id, 0)
            .await
        {
            warn!("upload {} parent propagation failed: {}", upload_id, e);
        }

        self.cache
            .remove(&ResourceId::new(&session.space_id, &session.node_id));
        self.cache
            .remove(&ResourceId::new(&session.space_id, &session.parent_id));

        if let Err(e) = session
            .cleanup(&self.lu, &self.tree, failed, keep_upload)
            .await
        {
            warn!("upload {} cleanup failed: {}", upload_id, e);
        }

        let space_owner = Node::read(&self.lu, &session.space_id, &session.space_id)
            .await
            .ok()
            .and_then(|root| root.owner);
        self.publish(Event::UploadReady {
            upload_id,
            failed,
            executing_user,
            file_ref: Reference::space_path(&session.space_id, session.path.clone()),
            space_owner,
            timestamp: Self::now_secs(),
        })
        .await;
        Ok(())
    }

    /// Periodically re-derives tree accounting for every space, repairing
    /// interrupted propagations.
    fn spawn_reconciler(self: &Arc<Self>) {
        let fs = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.reconciler_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let spaces = match fs.spaces.list_spaces(&SpaceFilter::default()).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("reconciler space listing failed: {}", e);
                        continue;
                    }
                };
                for space in spaces {
                    match fs.tree.reconcile_space(&space.id).await {
                        Ok(0) => {}
                        Ok(fixed) => info!("reconciled {} nodes in space {}", fixed, space.id),
                        Err(e) => warn!("reconcile of space {} failed: {}", space.id, e),
                    }
                }
            }
        });
    }
}

impl Drop for Decomposedfs {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
