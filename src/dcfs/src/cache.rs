use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dcfs_lib::ResourceId;

use crate::node::ResourceInfo;

/// Process-wide best-effort stat cache keyed by `(user, resource)`.
/// Mutations invalidate per resource across all users; consumers must not
/// rely on strict consistency.
pub struct StatCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, ResourceId), (ResourceInfo, Instant)>>,
}

impl StatCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, user_id: &str, resource_id: &ResourceId) -> Option<ResourceInfo> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().unwrap();
        let (info, stored_at) = entries.get(&(user_id.to_string(), resource_id.clone()))?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(info.clone())
    }

    pub fn insert(&self, user_id: &str, info: ResourceInfo) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        // opportunistic pruning keeps the map bounded without a sweeper task
        if entries.len() > 4096 {
            let ttl = self.ttl;
            entries.retain(|_, (_, stored_at)| stored_at.elapsed() <= ttl);
        }
        entries.insert((user_id.to_string(), info.id.clone()), (info, Instant::now()));
    }

    /// Drops the entries of one resource for every user.
    pub fn remove(&self, resource_id: &ResourceId) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(_, rid), _| rid != resource_id);
    }
}
