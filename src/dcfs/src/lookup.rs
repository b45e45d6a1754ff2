use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dcfs_lib::{path_segments, DcfsError, DcfsResult, Reference};

use crate::metadata::MetadataBackend;
use crate::node::Node;

pub const NODES_DIR: &str = "nodes";
pub const SPACES_DIR: &str = "spaces";
pub const UPLOADS_DIR: &str = "uploads";
pub const TRASH_DIR: &str = "trash";
pub const INDEXES_DIR: &str = "indexes";
pub const BY_USER_INDEX: &str = "by-user-id";
pub const CHILDREN_DIR: &str = "children";

/// Infix separating a trashed node directory name from its recycle key.
pub const TRASH_INFIX: &str = ".T.";

/// Resolves references to nodes and owns the on-disk layout arithmetic.
/// Nodes are value-like descriptors; they borrow the Lookup for every
/// operation instead of owning it.
pub struct Lookup {
    root: PathBuf,
    metadata: Arc<dyn MetadataBackend>,
    max_lock_cycles: u32,
    lock_cycle_factor_ms: u64,
}

impl Lookup {
    pub fn new(
        root: PathBuf,
        metadata: Arc<dyn MetadataBackend>,
        max_lock_cycles: u32,
        lock_cycle_factor_ms: u64,
    ) -> Self {
        Self {
            root,
            metadata,
            max_lock_cycles,
            lock_cycle_factor_ms,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &dyn MetadataBackend {
        self.metadata.as_ref()
    }

    pub fn lock_cycles(&self) -> u32 {
        self.max_lock_cycles
    }

    pub fn lock_factor_ms(&self) -> u64 {
        self.lock_cycle_factor_ms
    }

    fn shard(node_id: &str) -> DcfsResult<(&str, &str, &str)> {
        if node_id.len() < 5
            || !node_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(DcfsError::BadRequest(format!(
                "invalid node id: {}",
                node_id
            )));
        }
        Ok((&node_id[0..2], &node_id[2..4], &node_id[4..]))
    }

    /// `<root>/nodes/<aa>/<bb>/<id[4:]>`
    pub fn node_dir(&self, node_id: &str) -> DcfsResult<PathBuf> {
        let (aa, bb, rest) = Self::shard(node_id)?;
        Ok(self.root.join(NODES_DIR).join(aa).join(bb).join(rest))
    }

    /// Node directory of a trashed node, renamed in place inside its shard
    /// so descendant symlinks stay valid.
    pub fn trashed_node_dir(&self, node_id: &str, key: &str) -> DcfsResult<PathBuf> {
        let (aa, bb, rest) = Self::shard(node_id)?;
        Ok(self
            .root
            .join(NODES_DIR)
            .join(aa)
            .join(bb)
            .join(format!("{}{}{}", rest, TRASH_INFIX, key)))
    }

    pub fn children_dir(&self, node_id: &str) -> DcfsResult<PathBuf> {
        Ok(self.node_dir(node_id)?.join(CHILDREN_DIR))
    }

    /// Relative symlink target from a parent's `children/` directory to the
    /// child's node directory: `../../../../<aa>/<bb>/<rest>`.
    pub fn child_link_target(&self, child_id: &str) -> DcfsResult<PathBuf> {
        let (aa, bb, rest) = Self::shard(child_id)?;
        Ok(PathBuf::from("../../../..").join(aa).join(bb).join(rest))
    }

    /// Inverse of [`child_link_target`]: rebuilds the node id from the last
    /// three components of a child symlink target.
    pub fn node_id_from_link_target(&self, target: &Path) -> Option<String> {
        let parts: Vec<&str> = target
            .components()
            .filter_map(|c| match c {
                Component::Normal(p) => p.to_str(),
                _ => None,
            })
            .collect();
        if parts.len() < 3 {
            return None;
        }
        let tail = &parts[parts.len() - 3..];
        if tail[0].len() != 2 || tail[1].len() != 2 {
            return None;
        }
        Some(format!("{}{}{}", tail[0], tail[1], tail[2]))
    }

    /// Relative symlink target from `spaces/<type>/` to a space root node.
    pub fn space_link_target(&self, space_id: &str) -> DcfsResult<PathBuf> {
        let (aa, bb, rest) = Self::shard(space_id)?;
        Ok(PathBuf::from("../..")
            .join(NODES_DIR)
            .join(aa)
            .join(bb)
            .join(rest))
    }

    pub fn spaces_dir(&self, space_type: &str) -> PathBuf {
        self.root.join(SPACES_DIR).join(space_type)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn upload_info_path(&self, upload_id: &str) -> PathBuf {
        self.root
            .join(UPLOADS_DIR)
            .join(format!("{}.info", upload_id))
    }

    pub fn upload_data_path(&self, upload_id: &str) -> PathBuf {
        self.root.join(UPLOADS_DIR).join(upload_id)
    }

    pub fn trash_dir(&self, space_id: &str) -> PathBuf {
        self.root.join(TRASH_DIR).join(space_id)
    }

    pub fn trash_link_path(&self, space_id: &str, key: &str) -> PathBuf {
        self.trash_dir(space_id).join(key)
    }

    pub fn trash_info_path(&self, space_id: &str, key: &str) -> PathBuf {
        self.trash_dir(space_id).join(format!("{}.info", key))
    }

    /// Relative symlink target from `trash/<space_id>/` to the trashed node
    /// directory.
    pub fn trash_link_target(&self, node_id: &str, key: &str) -> DcfsResult<PathBuf> {
        let (aa, bb, rest) = Self::shard(node_id)?;
        Ok(PathBuf::from("../..")
            .join(NODES_DIR)
            .join(aa)
            .join(bb)
            .join(format!("{}{}{}", rest, TRASH_INFIX, key)))
    }

    pub fn user_index_dir(&self, user_opaque_id: &str) -> PathBuf {
        self.root
            .join(INDEXES_DIR)
            .join(BY_USER_INDEX)
            .join(user_opaque_id)
    }

    /// Resolves a reference to a node. Resolution priority: a resource id
    /// names the starting node inside its space, the path (relative `.` or
    /// absolute `/`) is then walked segment by segment. Walking below a
    /// missing node yields non-existent nodes, never an error.
    pub async fn node_from_resource(&self, reference: &Reference) -> DcfsResult<Node> {
        let rid = reference.resource_id.as_ref().ok_or_else(|| {
            DcfsError::PreconditionFailed(format!("reference without resource id: {}", reference))
        })?;
        if rid.storage_id.is_empty() {
            return Err(DcfsError::BadRequest(format!(
                "reference without storage id: {}",
                reference
            )));
        }

        // the space root must exist, it anchors the walk
        let space_root = Node::read(self, &rid.storage_id, &rid.storage_id).await?;

        let mut node = if rid.opaque_id.is_empty() || rid.opaque_id == rid.storage_id {
            space_root
        } else {
            Node::read(self, &rid.storage_id, &rid.opaque_id).await?
        };

        for segment in path_segments(&reference.path) {
            node = node.child(self, segment).await?;
        }
        Ok(node)
    }

    pub async fn node_from_id(&self, rid: &dcfs_lib::ResourceId) -> DcfsResult<Node> {
        self.node_from_resource(&Reference::id(rid.clone())).await
    }

    /// Rebuilds the external path of a node by walking parents toward the
    /// space root while `predicate` holds; stops (masking the remainder) at
    /// the first ancestor where it does not.
    pub async fn path<F, Fut>(&self, node: &Node, predicate: F) -> DcfsResult<String>
    where
        F: Fn(Node) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut segments: Vec<String> = Vec::new();
        let mut current = node.clone();
        while !current.is_space_root() && current.exists {
            if !predicate(current.clone()).await {
                break;
            }
            segments.push(current.name.clone());
            current = Node::read(self, &current.space_id, &current.parent_id).await?;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SidecarBackend;

    fn lookup(root: &Path) -> Lookup {
        Lookup::new(root.to_path_buf(), Arc::new(SidecarBackend), 2, 1)
    }

    #[test]
    fn node_dir_shards_by_prefix() {
        let lu = lookup(Path::new("/r"));
        let dir = lu.node_dir("8f14e45f-abcd").unwrap();
        assert_eq!(dir, PathBuf::from("/r/nodes/8f/14/e45f-abcd"));
    }

    #[test]
    fn rejects_bad_node_ids() {
        let lu = lookup(Path::new("/r"));
        assert!(lu.node_dir("ab").is_err());
        assert!(lu.node_dir("../../etc").is_err());
        assert!(lu.node_dir("aa/bb-cccc").is_err());
    }

    #[test]
    fn link_target_roundtrip() {
        let lu = lookup(Path::new("/r"));
        let target = lu.child_link_target("8f14e45f-abcd").unwrap();
        assert_eq!(target, PathBuf::from("../../../../8f/14/e45f-abcd"));
        assert_eq!(
            lu.node_id_from_link_target(&target).unwrap(),
            "8f14e45f-abcd"
        );
    }

    #[test]
    fn trash_target_points_at_renamed_dir() {
        let lu = lookup(Path::new("/r"));
        let t = lu.trash_link_target("8f14e45f-abcd", "k1").unwrap();
        assert_eq!(t, PathBuf::from("../../nodes/8f/14/e45f-abcd.T.k1"));
        let d = lu.trashed_node_dir("8f14e45f-abcd", "k1").unwrap();
        assert_eq!(d, PathBuf::from("/r/nodes/8f/14/e45f-abcd.T.k1"));
    }
}
