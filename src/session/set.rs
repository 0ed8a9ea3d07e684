//! The set of tunnel dependencies visible to one authenticated identity.
//!
//! A set is physically attached to whichever browser session most recently
//! resolved it (see [`SessionStore::resolve_set`](super::SessionStore)); its
//! members migrate between sessions of the same identity but never between
//! identities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::tunnel::dependency::{IdentityKey, TunnelDependency};

/// Mutable set of [`TunnelDependency`], keyed by dependency id.
///
/// The member map uses a plain mutex — nothing awaits while holding it. The
/// separate `op_lock` serializes start operations (dedup-check through
/// registration) so concurrent equal-key starts cannot double-create.
pub struct SessionTunnelSet {
    members: Mutex<HashMap<u64, Arc<TunnelDependency>>>,
    op_lock: AsyncMutex<()>,
}

impl SessionTunnelSet {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            op_lock: AsyncMutex::new(()),
        }
    }

    /// Hold this guard across dedup-check → forward open → registration.
    pub async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    pub fn insert(&self, dependency: Arc<TunnelDependency>) {
        self.members
            .lock()
            .expect("member lock poisoned")
            .insert(dependency.id(), dependency);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<TunnelDependency>> {
        self.members.lock().expect("member lock poisoned").remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<TunnelDependency>> {
        self.members.lock().expect("member lock poisoned").get(&id).cloned()
    }

    /// Find a member with the given identity key, if any.
    pub fn find_by_key(&self, key: &IdentityKey) -> Option<Arc<TunnelDependency>> {
        self.members
            .lock()
            .expect("member lock poisoned")
            .values()
            .find(|d| d.identity_key() == *key)
            .cloned()
    }

    /// Remove and return every member, leaving the set empty.
    pub fn drain(&self) -> Vec<Arc<TunnelDependency>> {
        self.members
            .lock()
            .expect("member lock poisoned")
            .drain()
            .map(|(_, d)| d)
            .collect()
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<Arc<TunnelDependency>> {
        self.members
            .lock()
            .expect("member lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().expect("member lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTunnelSet {
    fn default() -> Self {
        Self::new()
    }
}
