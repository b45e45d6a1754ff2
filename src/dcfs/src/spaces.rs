use std::sync::Arc;

use dcfs_lib::{
    DcfsError, DcfsResult, PermissionSet, RequestContext, ResourceId, UserId, QUOTA_UNCALCULATED,
    QUOTA_UNKNOWN, QUOTA_UNLIMITED, SPACE_TYPE_PERSONAL,
};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::lookup::Lookup;
use crate::metadata::{
    SPACE_DESCRIPTION_ATTR, SPACE_DISABLED_ATTR, SPACE_NAME_ATTR, SPACE_QUOTA_ATTR,
    SPACE_TYPE_ATTR,
};
use crate::node::{Node, NodeType};
use crate::tree::Tree;

/// Decoded value of the space quota attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    Unlimited,
    Uncalculated,
    Unknown,
    Limited(u64),
}

impl Quota {
    pub fn from_attr(value: &str) -> Self {
        match value {
            QUOTA_UNLIMITED => Quota::Unlimited,
            QUOTA_UNCALCULATED => Quota::Uncalculated,
            QUOTA_UNKNOWN => Quota::Unknown,
            other => other
                .parse::<u64>()
                .map(Quota::Limited)
                .unwrap_or(Quota::Unknown),
        }
    }

    pub fn to_attr(self) -> String {
        match self {
            Quota::Unlimited => QUOTA_UNLIMITED.to_string(),
            Quota::Uncalculated => QUOTA_UNCALCULATED.to_string(),
            Quota::Unknown => QUOTA_UNKNOWN.to_string(),
            Quota::Limited(bytes) => bytes.to_string(),
        }
    }

    pub fn from_bytes(bytes: u64) -> Self {
        if bytes == 0 {
            Quota::Unlimited
        } else {
            Quota::Limited(bytes)
        }
    }
}

/// Outward descriptor of one space, assembled from its root node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSpace {
    pub id: String,
    pub space_type: String,
    pub name: String,
    pub description: String,
    pub owner: Option<UserId>,
    /// Raw quota attribute value, empty when none was ever set.
    pub quota: String,
    pub disabled: bool,
    pub root: ResourceId,
    pub mtime: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SpaceFilter {
    pub space_id: Option<String>,
    pub space_type: Option<String>,
    pub owner: Option<UserId>,
}

#[derive(Debug, Clone, Default)]
pub struct SpacePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub quota: Option<u64>,
    pub disabled: Option<bool>,
}

/// Creates, lists and updates spaces. A space is its root node plus the
/// `spaces/<type>/` and `indexes/by-user-id/` symlinks pointing at it.
pub struct SpaceManager {
    lu: Arc<Lookup>,
    tree: Arc<Tree>,
    personal_space_quota: Option<u64>,
}

impl SpaceManager {
    pub fn new(lu: Arc<Lookup>, tree: Arc<Tree>, personal_space_quota: Option<u64>) -> Self {
        Self {
            lu,
            tree,
            personal_space_quota,
        }
    }

    /// Allocates a space id, materializes the root node and links the space
    /// and owner indexes. Personal spaces are one per user.
    pub async fn create_space(
        &self,
        ctx: &RequestContext,
        space_type: &str,
        name: &str,
        quota_bytes: Option<u64>,
    ) -> DcfsResult<StorageSpace> {
        if ctx.user.id.is_empty() {
            return Err(DcfsError::BadRequest("missing user".to_string()));
        }
        if space_type == SPACE_TYPE_PERSONAL {
            for existing in self.user_space_ids(&ctx.user.id).await? {
                if let Ok(space) = self.read_space(&existing).await {
                    if space.space_type == SPACE_TYPE_PERSONAL {
                        return Err(DcfsError::AlreadyExists(format!(
                            "personal space of {}",
                            ctx.user.id.opaque_id
                        )));
                    }
                }
            }
        }

        let space_id = dcfs_lib::new_id();
        let root = Node::new(
            &space_id,
            &space_id,
            "",
            name,
            NodeType::Dir,
            0,
            "",
            Some(ctx.user.id.clone()),
        );
        self.tree.write_node_dir(&root).await?;
        root.set_attr(&self.lu, SPACE_TYPE_ATTR, space_type)?;
        root.set_attr(&self.lu, SPACE_NAME_ATTR, name)?;

        let quota = quota_bytes.or(if space_type == SPACE_TYPE_PERSONAL {
            self.personal_space_quota
        } else {
            None
        });
        if let Some(bytes) = quota {
            root.set_attr(&self.lu, SPACE_QUOTA_ATTR, &Quota::from_bytes(bytes).to_attr())?;
        }
        root.set_grant(&self.lu, &ctx.user.id, &PermissionSet::all())?;

        let type_dir = self.lu.spaces_dir(space_type);
        fs::create_dir_all(&type_dir)
            .await
            .map_err(|e| DcfsError::IoError(format!("create space type dir failed: {}", e)))?;
        fs::symlink(
            self.lu.space_link_target(&space_id)?,
            type_dir.join(&space_id),
        )
        .await
        .map_err(|e| DcfsError::IoError(format!("link space failed: {}", e)))?;

        let index_dir = self.lu.user_index_dir(&ctx.user.id.opaque_id);
        fs::create_dir_all(&index_dir)
            .await
            .map_err(|e| DcfsError::IoError(format!("create user index failed: {}", e)))?;
        fs::symlink(
            std::path::PathBuf::from("../../../")
                .join(crate::lookup::SPACES_DIR)
                .join(space_type)
                .join(&space_id),
            index_dir.join(&space_id),
        )
        .await
        .map_err(|e| DcfsError::IoError(format!("index space failed: {}", e)))?;

        self.read_space(&space_id).await
    }

    /// Space ids indexed for a user.
    async fn user_space_ids(&self, user: &UserId) -> DcfsResult<Vec<String>> {
        let index_dir = self.lu.user_index_dir(&user.opaque_id);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&index_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(DcfsError::IoError(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DcfsError::IoError(e.to_string()))?
        {
            out.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(out)
    }

    /// Assembles the descriptor of one space from its root node.
    pub async fn read_space(&self, space_id: &str) -> DcfsResult<StorageSpace> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        let dir = root.internal_path(&self.lu)?;
        let md = self.lu.metadata();
        let attr = |key: &str| -> Option<String> { md.get(&dir, key).ok() };

        Ok(StorageSpace {
            id: space_id.to_string(),
            space_type: attr(SPACE_TYPE_ATTR).unwrap_or_default(),
            name: attr(SPACE_NAME_ATTR).unwrap_or_else(|| root.name.clone()),
            description: attr(SPACE_DESCRIPTION_ATTR).unwrap_or_default(),
            owner: root.owner.clone(),
            quota: attr(SPACE_QUOTA_ATTR).unwrap_or_default(),
            disabled: attr(SPACE_DISABLED_ATTR).as_deref() == Some("1"),
            root: ResourceId::space_root(space_id),
            mtime: root.get_tmtime(&self.lu)?,
        })
    }

    /// Lists spaces matching the filter. Permission filtering happens in the
    /// facade, which owns the policy collaborator.
    pub async fn list_spaces(&self, filter: &SpaceFilter) -> DcfsResult<Vec<StorageSpace>> {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(id) = &filter.space_id {
            candidates.push(id.clone());
        } else if let Some(owner) = &filter.owner {
            candidates = self.user_space_ids(owner).await?;
        } else {
            let spaces_root = self.lu.root().join(crate::lookup::SPACES_DIR);
            let mut type_dirs = match fs::read_dir(&spaces_root).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(DcfsError::IoError(e.to_string())),
            };
            while let Some(type_dir) = type_dirs
                .next_entry()
                .await
                .map_err(|e| DcfsError::IoError(e.to_string()))?
            {
                let mut entries = match fs::read_dir(type_dir.path()).await {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    candidates.push(entry.file_name().to_string_lossy().to_string());
                }
            }
        }

        let mut out = Vec::new();
        for space_id in candidates {
            let space = match self.read_space(&space_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("skipping space {}: {}", space_id, e);
                    continue;
                }
            };
            if let Some(t) = &filter.space_type {
                if space.space_type != *t {
                    continue;
                }
            }
            out.push(space);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Mutates name, description, quota or the disabled flag. The facade has
    /// already authorized the caller as owner or manager.
    pub async fn update_space(
        &self,
        _ctx: &RequestContext,
        space_id: &str,
        patch: &SpacePatch,
    ) -> DcfsResult<StorageSpace> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        if let Some(name) = &patch.name {
            root.set_attr(&self.lu, SPACE_NAME_ATTR, name)?;
        }
        if let Some(description) = &patch.description {
            root.set_attr(&self.lu, SPACE_DESCRIPTION_ATTR, description)?;
        }
        if let Some(quota) = patch.quota {
            root.set_attr(&self.lu, SPACE_QUOTA_ATTR, &Quota::from_bytes(quota).to_attr())?;
        }
        if let Some(disabled) = patch.disabled {
            if disabled {
                root.set_attr(&self.lu, SPACE_DISABLED_ATTR, "1")?;
            } else {
                root.remove_attr(&self.lu, SPACE_DISABLED_ATTR)?;
            }
        }
        self.read_space(space_id).await
    }

    /// The quota configured on a space root; `Unknown` when never set.
    pub fn read_quota(&self, root: &Node) -> DcfsResult<Quota> {
        let dir = root.internal_path(&self.lu)?;
        match self.lu.metadata().get(&dir, SPACE_QUOTA_ATTR) {
            Ok(v) => Ok(Quota::from_attr(&v)),
            Err(DcfsError::AttrNotFound(_)) => Ok(Quota::Unlimited),
            Err(e) => Err(e),
        }
    }

    /// Rejects a size-changing commit that would push the space over quota.
    pub async fn check_quota(&self, space_id: &str, delta: u64) -> DcfsResult<()> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        match self.read_quota(&root)? {
            Quota::Limited(total) => {
                let in_use = root.get_tree_size(&self.lu)?;
                if in_use.saturating_add(delta) > total {
                    return Err(DcfsError::InsufficientStorage(format!(
                        "quota {} exceeded: {} in use, {} requested",
                        total, in_use, delta
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// `(total, in_use, remaining)` for a space. Unlimited reports total 0
    /// with the host filesystem's free bytes as remaining; unknown and
    /// uncalculated report all zeros.
    pub async fn quota_usage(&self, space_id: &str) -> DcfsResult<(u64, u64, u64)> {
        let root = Node::read(&self.lu, space_id, space_id).await?;
        let in_use = root.get_tree_size(&self.lu)?;
        match self.read_quota(&root)? {
            Quota::Unknown | Quota::Uncalculated => Ok((0, 0, 0)),
            Quota::Unlimited => {
                let available = fs2::available_space(self.lu.root()).unwrap_or(0);
                Ok((0, in_use, available))
            }
            Quota::Limited(total) => {
                let remaining = total.saturating_sub(in_use);
                Ok((total, in_use, remaining))
            }
        }
    }
}
