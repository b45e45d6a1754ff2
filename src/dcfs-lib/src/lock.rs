use serde::{Deserialize, Serialize};

use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    WriteShared,
    WriteExclusive,
}

impl Default for LockType {
    fn default() -> Self {
        LockType::WriteExclusive
    }
}

/// A caller-visible lock on a node. Persisted as a JSON sidecar next to the
/// node directory and mirrored in an attribute for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: String,
    #[serde(default)]
    pub user: UserId,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub lock_type: LockType,
    /// Unix seconds; absent means the lock does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}

impl LockInfo {
    pub fn new(lock_id: impl Into<String>, user: UserId) -> Self {
        Self {
            lock_id: lock_id.into(),
            user,
            app_name: String::new(),
            lock_type: LockType::default(),
            expiration: None,
        }
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        match self.expiration {
            Some(exp) => exp <= now_secs,
            None => false,
        }
    }
}
