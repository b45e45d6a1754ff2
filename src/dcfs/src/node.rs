use std::collections::HashMap;

use dcfs_lib::{
    new_id, unix_nanos_now, DcfsError, DcfsResult, LockInfo, PermissionSet, RequestContext,
    ResourceId, UserId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::lookup::{Lookup, CHILDREN_DIR};
use crate::metadata::{
    BLOBID_ATTR, BLOBSIZE_ATTR, CHECKSUM_PREFIX, GRANT_PREFIX, ID_ATTR, METADATA_PREFIX,
    MTIME_ATTR, NAME_ATTR, OWNER_ID_ATTR, OWNER_IDP_ATTR, OWNER_TYPE_ATTR, PARENTID_ATTR,
    PROCESSING_ATTR, PROPAGATION_ATTR, TMTIME_ATTR, TREESIZE_ATTR, TYPE_ATTR, TYPE_DIR,
    TYPE_FILE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Dir,
}

impl NodeType {
    pub fn attr_value(&self) -> &'static str {
        match self {
            NodeType::File => TYPE_FILE,
            NodeType::Dir => TYPE_DIR,
        }
    }

    fn from_attr(value: &str) -> Option<Self> {
        match value {
            TYPE_FILE => Some(NodeType::File),
            TYPE_DIR => Some(NodeType::Dir),
            _ => None,
        }
    }
}

/// In-memory projection of one filesystem entry. Value-like: cheap to clone,
/// never owns the Lookup, re-reads disk state on demand.
#[derive(Debug, Clone)]
pub struct Node {
    pub space_id: String,
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub blob_id: String,
    pub blob_size: u64,
    pub owner: Option<UserId>,
    pub node_type: NodeType,
    pub exists: bool,
}

/// Outward-facing resource descriptor assembled from a node plus the
/// caller's effective permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub parent_id: String,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    /// Unix nanoseconds of the last content-affecting change.
    pub mtime: u64,
    pub etag: String,
    pub owner: Option<UserId>,
    pub permissions: PermissionSet,
    pub checksums: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockInfo>,
    pub processing: bool,
}

impl Node {
    /// In-memory constructor; never touches disk. Missing ids are allocated,
    /// file nodes without a blob id get a fresh one reserved.
    pub fn new(
        space_id: &str,
        id: &str,
        parent_id: &str,
        name: &str,
        node_type: NodeType,
        blob_size: u64,
        blob_id: &str,
        owner: Option<UserId>,
    ) -> Self {
        let id = if id.is_empty() { new_id() } else { id.to_string() };
        let blob_id = match node_type {
            NodeType::File if blob_id.is_empty() => new_id(),
            _ => blob_id.to_string(),
        };
        Self {
            space_id: space_id.to_string(),
            id,
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            blob_id,
            blob_size,
            owner,
            node_type,
            exists: false,
        }
    }

    fn not_existing(space_id: &str, parent_id: &str, name: &str) -> Self {
        Self {
            space_id: space_id.to_string(),
            id: String::new(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            blob_id: String::new(),
            blob_size: 0,
            owner: None,
            node_type: NodeType::File,
            exists: false,
        }
    }

    /// Loads a node's on-disk metadata. A missing node directory yields
    /// `exists == false`; a missing space root is an error, it anchors every
    /// resolution.
    pub async fn read(lu: &Lookup, space_id: &str, node_id: &str) -> DcfsResult<Node> {
        let dir = lu.node_dir(node_id)?;
        if !dir.exists() {
            if node_id == space_id {
                return Err(DcfsError::NotFound(format!("space {}", space_id)));
            }
            let mut n = Self::not_existing(space_id, "", "");
            n.id = node_id.to_string();
            return Ok(n);
        }
        Self::read_from_dir(lu, space_id, node_id, &dir).await
    }

    /// Loads a trashed node from its renamed shard directory.
    pub async fn read_trashed(
        lu: &Lookup,
        space_id: &str,
        node_id: &str,
        key: &str,
    ) -> DcfsResult<Node> {
        let dir = lu.trashed_node_dir(node_id, key)?;
        if !dir.exists() {
            return Err(DcfsError::NotFound(format!("trash entry {}", key)));
        }
        Self::read_from_dir(lu, space_id, node_id, &dir).await
    }

    async fn read_from_dir(
        lu: &Lookup,
        space_id: &str,
        node_id: &str,
        dir: &std::path::Path,
    ) -> DcfsResult<Node> {
        let md = lu.metadata();
        let attr = |key: &str| -> DcfsResult<Option<String>> {
            match md.get(dir, key) {
                Ok(v) => Ok(Some(v)),
                Err(DcfsError::AttrNotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        };

        let node_type = attr(TYPE_ATTR)?
            .and_then(|v| NodeType::from_attr(&v))
            .unwrap_or(NodeType::Dir);
        let blob_size = attr(BLOBSIZE_ATTR)?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let owner = match (attr(OWNER_IDP_ATTR)?, attr(OWNER_ID_ATTR)?) {
            (Some(idp), Some(id)) if !id.is_empty() => {
                let mut uid = UserId::new(idp, id);
                if let Some(t) = attr(OWNER_TYPE_ATTR)? {
                    uid.user_type = t;
                }
                Some(uid)
            }
            _ => None,
        };

        Ok(Node {
            space_id: space_id.to_string(),
            id: node_id.to_string(),
            parent_id: attr(PARENTID_ATTR)?.unwrap_or_default(),
            name: attr(NAME_ATTR)?.unwrap_or_default(),
            blob_id: attr(BLOBID_ATTR)?.unwrap_or_default(),
            blob_size,
            owner,
            node_type,
            exists: true,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }

    pub fn is_space_root(&self) -> bool {
        self.id == self.space_id
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(&self.space_id, &self.id)
    }

    /// Resolves `<self>/<name>` through the children symlink. A missing
    /// child, a broken symlink or any segment below a file resolves to a
    /// non-existent node, never to an error.
    pub async fn child(&self, lu: &Lookup, name: &str) -> DcfsResult<Node> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(DcfsError::BadRequest(format!("invalid name: {}", name)));
        }
        if !self.exists || self.id.is_empty() {
            return Ok(Self::not_existing(&self.space_id, &self.id, name));
        }
        let link = lu.children_dir(&self.id)?.join(name);
        let target = match tokio::fs::read_link(&link).await {
            Ok(t) => t,
            Err(_) => return Ok(Self::not_existing(&self.space_id, &self.id, name)),
        };
        let child_id = lu
            .node_id_from_link_target(&target)
            .ok_or_else(|| DcfsError::Internal(format!("malformed child link {}", link.display())))?;
        let mut child = Node::read(lu, &self.space_id, &child_id).await?;
        child.parent_id = self.id.clone();
        if child.name.is_empty() {
            child.name = name.to_string();
        }
        Ok(child)
    }

    pub async fn parent(&self, lu: &Lookup) -> DcfsResult<Node> {
        if self.parent_id.is_empty() {
            return Err(DcfsError::NotFound(format!("{} has no parent", self.id)));
        }
        Node::read(lu, &self.space_id, &self.parent_id).await
    }

    /// Writes every known attribute. Partial failures do not abort the
    /// remaining writes; the last error is returned.
    pub fn write_all_metadata(&self, lu: &Lookup) -> DcfsResult<()> {
        let dir = lu.node_dir(&self.id)?;
        let mut attrs: Vec<(String, String)> = vec![
            (ID_ATTR.to_string(), self.id.clone()),
            (PARENTID_ATTR.to_string(), self.parent_id.clone()),
            (NAME_ATTR.to_string(), self.name.clone()),
            (TYPE_ATTR.to_string(), self.node_type.attr_value().to_string()),
        ];
        if self.node_type == NodeType::File {
            attrs.push((BLOBID_ATTR.to_string(), self.blob_id.clone()));
            attrs.push((BLOBSIZE_ATTR.to_string(), self.blob_size.to_string()));
        }
        if let Some(owner) = &self.owner {
            attrs.push((OWNER_IDP_ATTR.to_string(), owner.idp.clone()));
            attrs.push((OWNER_ID_ATTR.to_string(), owner.opaque_id.clone()));
            attrs.push((OWNER_TYPE_ATTR.to_string(), owner.user_type.clone()));
        }
        lu.metadata().set_multiple(&dir, &attrs)
    }

    fn get_attr(&self, lu: &Lookup, key: &str) -> DcfsResult<Option<String>> {
        let dir = lu.node_dir(&self.id)?;
        match lu.metadata().get(&dir, key) {
            Ok(v) => Ok(Some(v)),
            Err(DcfsError::AttrNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_attr(&self, lu: &Lookup, key: &str, value: &str) -> DcfsResult<()> {
        let dir = lu.node_dir(&self.id)?;
        lu.metadata().set(&dir, key, value)
    }

    pub fn remove_attr(&self, lu: &Lookup, key: &str) -> DcfsResult<()> {
        let dir = lu.node_dir(&self.id)?;
        lu.metadata().remove(&dir, key)
    }

    pub fn get_mtime(&self, lu: &Lookup) -> DcfsResult<u64> {
        Ok(self
            .get_attr(lu, MTIME_ATTR)?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    pub fn set_mtime(&self, lu: &Lookup, nanos: u64) -> DcfsResult<()> {
        self.set_attr(lu, MTIME_ATTR, &nanos.to_string())
    }

    /// Tree mtime: the max of the subtree's content-affecting changes. Falls
    /// back to the node's own mtime while no propagation has reached it yet.
    pub fn get_tmtime(&self, lu: &Lookup) -> DcfsResult<u64> {
        if let Some(v) = self.get_attr(lu, TMTIME_ATTR)? {
            if let Ok(n) = v.parse::<u64>() {
                return Ok(n);
            }
        }
        self.get_mtime(lu)
    }

    pub fn set_tmtime(&self, lu: &Lookup, nanos: u64) -> DcfsResult<()> {
        self.set_attr(lu, TMTIME_ATTR, &nanos.to_string())
    }

    pub fn get_tree_size(&self, lu: &Lookup) -> DcfsResult<u64> {
        Ok(self
            .get_attr(lu, TREESIZE_ATTR)?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    pub fn set_tree_size(&self, lu: &Lookup, size: u64) -> DcfsResult<()> {
        self.set_attr(lu, TREESIZE_ATTR, &size.to_string())
    }

    /// Size that delete/move propagation has to move around: the blob size
    /// for files, the accounted subtree size for directories.
    pub fn subtree_size(&self, lu: &Lookup) -> DcfsResult<u64> {
        match self.node_type {
            NodeType::File => Ok(self.blob_size),
            NodeType::Dir => self.get_tree_size(lu),
        }
    }

    pub fn has_propagation_sentinel(&self, lu: &Lookup) -> DcfsResult<bool> {
        Ok(self.get_attr(lu, PROPAGATION_ATTR)?.as_deref() == Some("1"))
    }

    pub fn processing_upload(&self, lu: &Lookup) -> DcfsResult<Option<String>> {
        self.get_attr(lu, PROCESSING_ATTR)
    }

    /// Two reads of an unchanged node yield equal etags; any tmtime bump
    /// changes it. 34 characters including the quoting.
    pub fn etag(&self, lu: &Lookup) -> DcfsResult<String> {
        let tmtime = self.get_tmtime(lu)?;
        let mtime = self.get_mtime(lu)?;
        Ok(calculate_etag(&self.id, tmtime, mtime))
    }

    pub fn checksums(&self, lu: &Lookup) -> DcfsResult<HashMap<String, String>> {
        let dir = lu.node_dir(&self.id)?;
        let mut out = HashMap::new();
        for key in lu.metadata().list(&dir)? {
            if let Some(algo) = key.strip_prefix(CHECKSUM_PREFIX) {
                if let Ok(v) = lu.metadata().get(&dir, &key) {
                    out.insert(algo.to_string(), v);
                }
            }
        }
        Ok(out)
    }

    /// Arbitrary caller-defined metadata attributes.
    pub fn user_metadata(&self, lu: &Lookup) -> DcfsResult<HashMap<String, String>> {
        let dir = lu.node_dir(&self.id)?;
        let mut out = HashMap::new();
        for key in lu.metadata().list(&dir)? {
            if let Some(name) = key.strip_prefix(METADATA_PREFIX) {
                if let Ok(v) = lu.metadata().get(&dir, &key) {
                    out.insert(name.to_string(), v);
                }
            }
        }
        Ok(out)
    }

    /// Grants stored on this node, `(grantee, permissions)` pairs.
    pub fn grants(&self, lu: &Lookup) -> DcfsResult<Vec<(UserId, PermissionSet)>> {
        let dir = lu.node_dir(&self.id)?;
        let mut out = Vec::new();
        for key in lu.metadata().list(&dir)? {
            let Some(grantee) = key.strip_prefix(GRANT_PREFIX) else {
                continue;
            };
            let Some(id) = grantee.strip_prefix("u:") else {
                continue;
            };
            let value = match lu.metadata().get(&dir, &key) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match serde_json::from_str::<PermissionSet>(&value) {
                Ok(set) => out.push((UserId::new("", id), set)),
                Err(e) => {
                    log::warn!("malformed grant {} on {}: {}", key, self.id, e);
                }
            }
        }
        Ok(out)
    }

    pub fn set_grant(&self, lu: &Lookup, grantee: &UserId, set: &PermissionSet) -> DcfsResult<()> {
        let key = format!("{}u:{}", GRANT_PREFIX, grantee.opaque_id);
        let value = serde_json::to_string(set).map_err(|e| DcfsError::Internal(e.to_string()))?;
        self.set_attr(lu, &key, &value)
    }

    /// Fails with the current holder's lock id unless the context presents a
    /// matching lock token.
    pub async fn check_lock(&self, lu: &Lookup, ctx: &RequestContext) -> DcfsResult<()> {
        let Some(lock) = self.read_lock(lu).await? else {
            return Ok(());
        };
        if ctx.lock_id.as_deref() == Some(lock.lock_id.as_str()) {
            return Ok(());
        }
        Err(DcfsError::Locked(lock.lock_id))
    }

    /// The owner of this node's space, or the first manager grantee of an
    /// ownerless space root.
    pub async fn space_owner_or_manager(&self, lu: &Lookup) -> DcfsResult<Option<UserId>> {
        let root = if self.is_space_root() {
            self.clone()
        } else {
            Node::read(lu, &self.space_id, &self.space_id).await?
        };
        if let Some(owner) = &root.owner {
            if !owner.is_empty() {
                return Ok(Some(owner.clone()));
            }
        }
        Ok(root
            .grants(lu)?
            .into_iter()
            .find(|(_, set)| set.is_manager())
            .map(|(grantee, _)| grantee))
    }

    /// Projects the node plus an assembled permission set into the outward
    /// resource descriptor.
    pub async fn as_resource_info(
        &self,
        lu: &Lookup,
        perms: &PermissionSet,
    ) -> DcfsResult<ResourceInfo> {
        let size = match self.node_type {
            NodeType::File => self.blob_size,
            NodeType::Dir => self.get_tree_size(lu)?,
        };
        Ok(ResourceInfo {
            id: self.resource_id(),
            parent_id: self.parent_id.clone(),
            name: self.name.clone(),
            node_type: self.node_type,
            size,
            mtime: self.get_tmtime(lu)?,
            etag: self.etag(lu)?,
            owner: self.owner.clone(),
            permissions: *perms,
            checksums: self.checksums(lu)?,
            metadata: self.user_metadata(lu)?,
            lock: self.read_lock(lu).await?,
            processing: self.processing_upload(lu)?.is_some(),
        })
    }

    /// The on-disk directory of this node.
    pub fn internal_path(&self, lu: &Lookup) -> DcfsResult<std::path::PathBuf> {
        lu.node_dir(&self.id)
    }

    pub fn children_path(&self, lu: &Lookup) -> DcfsResult<std::path::PathBuf> {
        Ok(self.internal_path(lu)?.join(CHILDREN_DIR))
    }
}

/// Quoted truncated digest over identity and both clocks; the quoting is the
/// stable prefix clients compare against.
pub fn calculate_etag(id: &str, tmtime_nanos: u64, mtime_nanos: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(tmtime_nanos.to_be_bytes());
    hasher.update(mtime_nanos.to_be_bytes());
    let digest = hasher.finalize();
    format!("\"{}\"", hex::encode(&digest[..16]))
}

/// Nanosecond timestamp helper shared by tree and upload code paths.
pub fn now_nanos() -> u64 {
    unix_nanos_now() as u64
}
