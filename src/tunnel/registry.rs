//! Process-wide tunnel registry — allocation, dedup, stop, and reaping.
//!
//! The registry maps each dependency's local forward port to the dependency.
//! Start requests dedup against the caller's merged session set by identity
//! key: an equal-key hit is idempotent success and opens no new forward. The
//! reaper sweeps the map on a fixed interval and retires entries whose
//! backing forward has stopped running, through the same `stop` path as an
//! explicit request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::GatewayError;
use crate::session::set::SessionTunnelSet;
use crate::ssh::{Credential, ForwardRequest, Forwarder};

use super::dependency::{resolve_root, IdentityKey, TunnelDependency};

/// Parameters for starting a generic HTTP tunnel.
#[derive(Debug, Clone)]
pub struct HttpTunnelSpec {
    pub via_gateway: String,
    /// Forward target as seen from the gateway (often `localhost`).
    pub remote_host: String,
    pub remote_port: u16,
    /// Root path template; may contain the `_id_` placeholder.
    pub root: String,
    pub secure: bool,
    pub rewrite_html: bool,
}

/// Parameters for starting a desktop session.
#[derive(Debug, Clone)]
pub struct DesktopSpec {
    pub via_gateway: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub display_name: String,
    pub password: String,
    pub protocol: String,
}

/// Process-wide table `local port -> dependency`, plus the id counter.
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<u16, Arc<TunnelDependency>>>,
    forwarder: Arc<dyn Forwarder>,
    next_id: AtomicU64,
}

/// The logical target host for dedup: forwards that terminate on the gateway
/// itself (`localhost` target) are keyed by the gateway's name, so the same
/// service reached through the same gateway dedups regardless of phrasing.
fn key_host(remote_host: &str, via_gateway: &str) -> String {
    if remote_host == "localhost" {
        via_gateway.to_string()
    } else {
        remote_host.to_string()
    }
}

impl TunnelRegistry {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            forwarder,
            next_id: AtomicU64::new(0),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn register(&self, dependency: &Arc<TunnelDependency>, set: &Arc<SessionTunnelSet>) {
        dependency.set_owner(set);
        self.tunnels
            .lock()
            .expect("registry lock poisoned")
            .insert(dependency.local_port(), dependency.clone());
        set.insert(dependency.clone());
    }

    /// Start (or dedup-hit) a generic HTTP tunnel for the caller's set.
    ///
    /// Holds the set's operation lock across dedup-check → forward open →
    /// registration, so concurrent equal-key starts cannot double-create. On
    /// SSH failure nothing is committed.
    pub async fn start_http(
        &self,
        credential: &Credential,
        spec: HttpTunnelSpec,
        set: &Arc<SessionTunnelSet>,
    ) -> Result<Arc<TunnelDependency>, GatewayError> {
        let _op = set.lock_ops().await;

        let id = self.allocate_id();
        let root = resolve_root(&spec.root, id);
        let host = key_host(&spec.remote_host, &spec.via_gateway);
        let key = IdentityKey::Http {
            scheme: if spec.secure { "https" } else { "http" },
            host: host.clone(),
            port: spec.remote_port,
            root: root.clone(),
        };

        if let Some(existing) = set.find_by_key(&key) {
            debug!(id = existing.id(), "HTTP tunnel dedup hit");
            return Ok(existing);
        }

        let tunnel = self
            .forwarder
            .open_forward(
                credential,
                ForwardRequest {
                    via_gateway: spec.via_gateway,
                    remote_host: spec.remote_host,
                    remote_port: spec.remote_port,
                },
            )
            .await
            .map_err(|e| GatewayError::TunnelEstablishment(e.to_string()))?;

        let dependency = Arc::new(TunnelDependency::http(
            id,
            root,
            spec.secure,
            spec.rewrite_html,
            host,
            spec.remote_port,
            tunnel,
        ));
        self.register(&dependency, set);
        info!(
            id,
            local_port = dependency.local_port(),
            "HTTP tunnel started"
        );
        Ok(dependency)
    }

    /// Start (or rename) a desktop session for the caller's set.
    ///
    /// A dedup hit updates the display name and password in place and
    /// returns the existing instance without reopening the forward.
    pub async fn start_desktop(
        &self,
        credential: &Credential,
        spec: DesktopSpec,
        set: &Arc<SessionTunnelSet>,
    ) -> Result<Arc<TunnelDependency>, GatewayError> {
        let _op = set.lock_ops().await;

        let host = key_host(&spec.remote_host, &spec.via_gateway);
        let key = IdentityKey::Desktop {
            protocol: spec.protocol.clone(),
            host: host.clone(),
            port: spec.remote_port,
        };

        if let Some(existing) = set.find_by_key(&key) {
            debug!(id = existing.id(), "Desktop session dedup hit, updating metadata");
            existing.update_desktop_meta(spec.display_name, spec.password);
            return Ok(existing);
        }

        let tunnel = self
            .forwarder
            .open_forward(
                credential,
                ForwardRequest {
                    via_gateway: spec.via_gateway,
                    remote_host: spec.remote_host,
                    remote_port: spec.remote_port,
                },
            )
            .await
            .map_err(|e| GatewayError::TunnelEstablishment(e.to_string()))?;

        let dependency = Arc::new(TunnelDependency::desktop(
            self.allocate_id(),
            spec.display_name,
            spec.password,
            spec.protocol,
            host,
            spec.remote_port,
            tunnel,
        ));
        self.register(&dependency, set);
        info!(
            id = dependency.id(),
            local_port = dependency.local_port(),
            "Desktop session started"
        );
        Ok(dependency)
    }

    /// Retire a dependency: drop its registry entry, remove it from the set
    /// that holds it, and stop the forward if it still runs. No-op when the
    /// entry is already gone.
    pub fn stop(&self, dependency: &Arc<TunnelDependency>) {
        let removed = self
            .tunnels
            .lock()
            .expect("registry lock poisoned")
            .remove(&dependency.local_port());
        if removed.is_none() {
            return;
        }
        dependency.detach_owner();
        if dependency.tunnel().is_running() {
            dependency.tunnel().stop();
        }
        info!(
            id = dependency.id(),
            local_port = dependency.local_port(),
            "Tunnel stopped"
        );
    }

    /// Single liveness sweep: route every entry whose forward reports not
    /// running through [`stop`](Self::stop). Running forwards are never
    /// touched. Called from one dedicated task, so sweeps cannot overlap.
    pub fn reap(&self) {
        let dead: Vec<Arc<TunnelDependency>> = self
            .tunnels
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|d| !d.tunnel().is_running())
            .cloned()
            .collect();
        for dependency in dead {
            info!(
                id = dependency.id(),
                local_port = dependency.local_port(),
                "Reaping dead tunnel"
            );
            self.stop(&dependency);
        }
    }

    /// Stop every registered tunnel (process shutdown).
    pub fn drain_all(&self) {
        let all: Vec<Arc<TunnelDependency>> = self
            .tunnels
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for dependency in all {
            self.stop(&dependency);
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
