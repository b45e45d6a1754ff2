use serde::{Deserialize, Serialize};

use crate::{DcfsError, DcfsResult};

/// Identifies a node inside a space. `storage_id` is the space id,
/// `opaque_id` the node id (empty means the space root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub storage_id: String,
    pub opaque_id: String,
}

impl ResourceId {
    pub fn new(storage_id: impl Into<String>, opaque_id: impl Into<String>) -> Self {
        Self {
            storage_id: storage_id.into(),
            opaque_id: opaque_id.into(),
        }
    }

    /// The resource id of a space root, where node id == space id.
    pub fn space_root(space_id: &str) -> Self {
        Self::new(space_id, space_id)
    }
}

/// A reference to a resource: an id, an id plus a relative path, or a space
/// plus an absolute path.
///
/// String form: `<storage_id>[!<opaque_id>][/<path>]`. A path starting with
/// `.` is relative to the resource id, a path starting with `/` is walked
/// from the space root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub resource_id: Option<ResourceId>,
    pub path: String,
}

impl Reference {
    pub fn id(resource_id: ResourceId) -> Self {
        Self {
            resource_id: Some(resource_id),
            path: String::new(),
        }
    }

    pub fn space_path(space_id: &str, path: impl Into<String>) -> Self {
        Self {
            resource_id: Some(ResourceId::new(space_id, "")),
            path: normalize_absolute(path.into()),
        }
    }

    pub fn relative(resource_id: ResourceId, path: impl Into<String>) -> Self {
        Self {
            resource_id: Some(resource_id),
            path: normalize_relative(path.into()),
        }
    }

    pub fn is_relative(&self) -> bool {
        self.path.starts_with('.')
    }

    /// Parses the `<storage_id>[!<opaque_id>][/<path>]` form.
    pub fn parse(s: &str) -> DcfsResult<Self> {
        if s.is_empty() {
            return Err(DcfsError::BadRequest("empty reference".to_string()));
        }
        let (head, path) = match s.split_once('/') {
            Some((head, rest)) => (head, format!("/{}", rest)),
            None => (s, String::new()),
        };
        let (storage_id, opaque_id) = match head.split_once('!') {
            Some((sid, oid)) => (sid, oid),
            None => (head, ""),
        };
        if storage_id.is_empty() {
            return Err(DcfsError::BadRequest(format!("invalid reference: {}", s)));
        }
        let path = if !opaque_id.is_empty() && !path.is_empty() {
            // a path below a concrete node is relative to that node
            normalize_relative(path)
        } else {
            path
        };
        Ok(Self {
            resource_id: Some(ResourceId::new(storage_id, opaque_id)),
            path,
        })
    }

    /// Reference of the parent directory plus the base name, for operations
    /// that address a not-yet-existing child.
    pub fn split_parent(&self) -> DcfsResult<(Reference, String)> {
        let trimmed = self.path.trim_end_matches('/');
        let name = trimmed.rsplit('/').next().unwrap_or("").to_string();
        if name.is_empty() || name == "." || name == ".." {
            return Err(DcfsError::BadRequest(format!(
                "invalid path: {}",
                self.path
            )));
        }
        let dir = &trimmed[..trimmed.len() - name.len()];
        let dir = dir.trim_end_matches('/');
        let parent_path = if self.is_relative() {
            if dir.is_empty() || dir == "." {
                ".".to_string()
            } else {
                dir.to_string()
            }
        } else if dir.is_empty() {
            "/".to_string()
        } else {
            dir.to_string()
        };
        Ok((
            Reference {
                resource_id: self.resource_id.clone(),
                path: parent_path,
            },
            name,
        ))
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.resource_id {
            Some(rid) if rid.opaque_id.is_empty() => write!(f, "{}{}", rid.storage_id, self.path),
            Some(rid) => {
                // the wire form carries no "." marker, relativeness is
                // implied by the presence of the opaque id
                let path = self.path.strip_prefix('.').unwrap_or(&self.path);
                write!(f, "{}!{}{}", rid.storage_id, rid.opaque_id, path)
            }
            None => write!(f, "{}", self.path),
        }
    }
}

fn normalize_absolute(path: String) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    }
}

fn normalize_relative(path: String) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return ".".to_string();
    }
    if trimmed.starts_with("./") {
        trimmed.to_string()
    } else {
        format!("./{}", trimmed)
    }
}

/// Splits a normalized reference path into its walkable segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}
