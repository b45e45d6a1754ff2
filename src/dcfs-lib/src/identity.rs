use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::DcfsResult;

/// A user identity as supplied by the caller. Identity resolution happens
/// outside the storage core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId {
    pub idp: String,
    pub opaque_id: String,
    #[serde(default)]
    pub user_type: String,
}

impl UserId {
    pub fn new(idp: impl Into<String>, opaque_id: impl Into<String>) -> Self {
        Self {
            idp: idp.into(),
            opaque_id: opaque_id.into(),
            user_type: "primary".to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.opaque_id.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
}

impl User {
    pub fn new(idp: &str, opaque_id: &str, username: &str) -> Self {
        Self {
            id: UserId::new(idp, opaque_id),
            username: username.to_string(),
            display_name: username.to_string(),
        }
    }
}

/// The effective permission set for one user on one node. The evaluation
/// policy producing it is external, the core only transports and checks it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    pub stat: bool,
    pub get_path: bool,
    pub get_quota: bool,
    pub initiate_file_download: bool,
    pub initiate_file_upload: bool,
    pub list_container: bool,
    pub create_container: bool,
    pub delete: bool,
    pub move_resource: bool,
    pub list_recycle: bool,
    pub restore_recycle_item: bool,
    pub purge_recycle: bool,
    pub add_grant: bool,
}

impl PermissionSet {
    pub fn all() -> Self {
        Self {
            stat: true,
            get_path: true,
            get_quota: true,
            initiate_file_download: true,
            initiate_file_upload: true,
            list_container: true,
            create_container: true,
            delete: true,
            move_resource: true,
            list_recycle: true,
            restore_recycle_item: true,
            purge_recycle: true,
            add_grant: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Managers hold the grant-management permission.
    pub fn is_manager(&self) -> bool {
        self.add_grant
    }

    /// Union, used when a listing merges a parent's set with a child grant.
    pub fn add(&mut self, other: &PermissionSet) {
        self.stat |= other.stat;
        self.get_path |= other.get_path;
        self.get_quota |= other.get_quota;
        self.initiate_file_download |= other.initiate_file_download;
        self.initiate_file_upload |= other.initiate_file_upload;
        self.list_container |= other.list_container;
        self.create_container |= other.create_container;
        self.delete |= other.delete;
        self.move_resource |= other.move_resource;
        self.list_recycle |= other.list_recycle;
        self.restore_recycle_item |= other.restore_recycle_item;
        self.purge_recycle |= other.purge_recycle;
        self.add_grant |= other.add_grant;
    }
}

/// Per-request state handed into every facade operation: who is calling and
/// which lock token, if any, the caller presents.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: User,
    pub lock_id: Option<String>,
}

impl RequestContext {
    pub fn new(user: User) -> Self {
        Self {
            user,
            lock_id: None,
        }
    }

    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }
}

/// External policy collaborator: computes the effective permission set of
/// the context user on a node, identified here by its space root owner and
/// its grant table so the core stays free of policy.
#[async_trait]
pub trait PermissionsChecker: Send + Sync {
    async fn assemble_permissions(
        &self,
        ctx: &RequestContext,
        node_owner: Option<&UserId>,
        grants: &[(UserId, PermissionSet)],
    ) -> DcfsResult<PermissionSet>;
}

/// Default policy used when no external checker is wired in: owners and
/// manager grantees get everything, other grantees their granted set.
pub struct OwnerGrantsPermissions;

#[async_trait]
impl PermissionsChecker for OwnerGrantsPermissions {
    async fn assemble_permissions(
        &self,
        ctx: &RequestContext,
        node_owner: Option<&UserId>,
        grants: &[(UserId, PermissionSet)],
    ) -> DcfsResult<PermissionSet> {
        if let Some(owner) = node_owner {
            if !owner.is_empty() && *owner == ctx.user.id {
                return Ok(PermissionSet::all());
            }
        }
        let mut perms = PermissionSet::none();
        for (grantee, set) in grants {
            // grants are keyed by opaque id, the idp is not stored with them
            if grantee.opaque_id == ctx.user.id.opaque_id {
                perms.add(set);
            }
        }
        Ok(perms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn owner_gets_all_permissions() {
        let owner = UserId::new("idp", "u1");
        let ctx = RequestContext::new(User::new("idp", "u1", "alice"));
        let perms = OwnerGrantsPermissions
            .assemble_permissions(&ctx, Some(&owner), &[])
            .await
            .unwrap();
        assert_eq!(perms, PermissionSet::all());
    }

    #[tokio::test]
    async fn stranger_gets_nothing() {
        let owner = UserId::new("idp", "u1");
        let ctx = RequestContext::new(User::new("idp", "u2", "bob"));
        let perms = OwnerGrantsPermissions
            .assemble_permissions(&ctx, Some(&owner), &[])
            .await
            .unwrap();
        assert_eq!(perms, PermissionSet::none());
        assert!(!perms.stat);
    }

    #[tokio::test]
    async fn grants_are_merged() {
        let owner = UserId::new("idp", "u1");
        let ctx = RequestContext::new(User::new("idp", "u2", "bob"));
        let mut read = PermissionSet::none();
        read.stat = true;
        read.initiate_file_download = true;
        let mut list = PermissionSet::none();
        list.list_container = true;
        let grants = vec![
            (UserId::new("idp", "u2"), read),
            (UserId::new("idp", "u2"), list),
            (UserId::new("idp", "u3"), PermissionSet::all()),
        ];
        let perms = OwnerGrantsPermissions
            .assemble_permissions(&ctx, Some(&owner), &grants)
            .await
            .unwrap();
        assert!(perms.stat && perms.initiate_file_download && perms.list_container);
        assert!(!perms.delete);
    }
}
