//! Browser session tracking and identity attachment.
//!
//! A session is created on first contact and identified by an HttpOnly
//! cookie. The OAuth2/certificate flow that authenticates a user lives
//! outside this service; it deposits the authenticated username via
//! `POST /api/session/identity`, after which the session can start tunnels.
//!
//! One identity may hold several concurrent browser sessions. Tunnel
//! dependencies follow the identity, not the session: resolving the tunnel
//! set from any session drains the sibling sessions' sets into the caller's,
//! so at most one set per identity is ever live.

pub mod set;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::GatewayError;
use self::set::SessionTunnelSet;

/// An authenticated identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Remote username, as produced by the external auth flow.
    pub username: String,
}

/// One browser session.
pub struct Session {
    id: String,
    created_at: Instant,
    identity: RwLock<Option<Identity>>,
    tunnels: Mutex<Option<Arc<SessionTunnelSet>>>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            identity: RwLock::new(None),
            tunnels: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().expect("identity lock poisoned").clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        *self.identity.write().expect("identity lock poisoned") = Some(identity);
    }

    /// The set currently attached to this session, if any.
    pub fn attached_set(&self) -> Option<Arc<SessionTunnelSet>> {
        self.tunnels.lock().expect("tunnels lock poisoned").clone()
    }

    fn attach_set_if_absent(&self) -> Arc<SessionTunnelSet> {
        self.tunnels
            .lock()
            .expect("tunnels lock poisoned")
            .get_or_insert_with(|| Arc::new(SessionTunnelSet::new()))
            .clone()
    }
}

/// Process-wide table of active sessions.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Per-identity locks serializing concurrent `resolve_set` calls, so two
    /// simultaneous merges cannot both observe a non-empty donor.
    merge_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            merge_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map poisoned")
            .get(id)
            .cloned()
    }

    /// Look up a session by cookie value, creating a fresh one when the
    /// cookie is absent or stale. Returns `(session, created)`.
    pub fn get_or_create(&self, id: Option<&str>) -> (Arc<Session>, bool) {
        if let Some(id) = id {
            if let Some(session) = self.get(id) {
                return (session, false);
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        self.sessions
            .write()
            .expect("session map poisoned")
            .insert(id, session.clone());
        debug!(session_id = %session.id, "Session created");
        (session, true)
    }

    /// Remove a session from the store, returning it for teardown.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .expect("session map poisoned")
            .remove(id)
    }

    /// All sessions currently in the store.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Resolve the tunnel set for `session`'s identity, migrating members
    /// from every sibling session of the same identity into it.
    ///
    /// Siblings are drained and left with empty sets; drained dependencies
    /// are re-owned by the returned set. Concurrent resolutions for the same
    /// identity are serialized on a per-identity lock.
    pub async fn resolve_set(
        &self,
        session: &Arc<Session>,
    ) -> Result<Arc<SessionTunnelSet>, GatewayError> {
        let identity = session.identity().ok_or(GatewayError::Unauthorized)?;

        let merge_lock = {
            let mut locks = self.merge_locks.lock().await;
            locks
                .entry(identity.username.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = merge_lock.lock().await;

        let set = session.attach_set_if_absent();

        for sibling in self.all() {
            if sibling.id == session.id {
                continue;
            }
            if sibling.identity().as_ref() != Some(&identity) {
                continue;
            }
            let Some(donor) = sibling.attached_set() else {
                continue;
            };
            let drained = donor.drain();
            if drained.is_empty() {
                continue;
            }
            debug!(
                from = %sibling.id,
                to = %session.id,
                count = drained.len(),
                "Merged tunnel set across sessions"
            );
            for dependency in drained {
                dependency.set_owner(&set);
                set.insert(dependency);
            }
        }

        Ok(set)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::Tunnel;
    use crate::tunnel::dependency::TunnelDependency;
    use std::sync::atomic::AtomicBool;

    fn test_session(store: &SessionStore, username: &str) -> Arc<Session> {
        let (session, created) = store.get_or_create(None);
        assert!(created);
        session.set_identity(Identity {
            username: username.to_string(),
        });
        session
    }

    fn test_dependency(id: u64, local_port: u16) -> Arc<TunnelDependency> {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = tokio::sync::oneshot::channel();
        let tunnel = Tunnel::handle(local_port, "vis01".to_string(), 8888, running, tx);
        Arc::new(TunnelDependency::http(
            id,
            "jupyter".to_string(),
            false,
            false,
            "vis01".to_string(),
            8888,
            tunnel,
        ))
    }

    #[tokio::test]
    async fn test_resolve_creates_empty_set() {
        let store = SessionStore::new();
        let session = test_session(&store, "jdoe");
        let set = store.resolve_set(&session).await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_without_identity_is_unauthorized() {
        let store = SessionStore::new();
        let (session, _) = store.get_or_create(None);
        assert!(matches!(
            store.resolve_set(&session).await,
            Err(GatewayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_merge_migrates_members_and_clears_donor() {
        // A tunnel created from session A becomes visible from session B,
        // and a subsequent resolve from A returns an empty set.
        let store = SessionStore::new();
        let a = test_session(&store, "jdoe");
        let b = test_session(&store, "jdoe");

        let set_a = store.resolve_set(&a).await.unwrap();
        let dep = test_dependency(1, 9101);
        dep.set_owner(&set_a);
        set_a.insert(dep.clone());

        let set_b = store.resolve_set(&b).await.unwrap();
        assert!(set_b.get(1).is_some());
        assert!(set_a.is_empty());

        // Ownership followed the migration.
        let set_a_again = store.resolve_set(&a).await.unwrap();
        assert!(set_a_again.get(1).is_some());
        assert!(set_b.is_empty());
    }

    #[tokio::test]
    async fn test_merge_does_not_cross_identities() {
        let store = SessionStore::new();
        let a = test_session(&store, "jdoe");
        let b = test_session(&store, "other");

        let set_a = store.resolve_set(&a).await.unwrap();
        let dep = test_dependency(1, 9102);
        dep.set_owner(&set_a);
        set_a.insert(dep);

        let set_b = store.resolve_set(&b).await.unwrap();
        assert!(set_b.is_empty());
        assert_eq!(set_a.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cookie_creates_fresh_session() {
        let store = SessionStore::new();
        let (_, created) = store.get_or_create(Some("gone"));
        assert!(created);
    }
}
