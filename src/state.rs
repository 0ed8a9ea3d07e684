//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::proxy::http::HttpClient;
use crate::proxy::ws::HandshakeStash;
use crate::session::SessionStore;
use crate::tunnel::registry::TunnelRegistry;

/// Shared application state for the passage gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Active browser sessions and their identity attachments.
    pub sessions: Arc<SessionStore>,
    /// Process-wide tunnel table — allocation, dedup, stop, reaping.
    pub registry: Arc<TunnelRegistry>,
    /// One-time tickets carrying resolved context into WebSocket upgrades.
    pub stash: Arc<HandshakeStash>,
    /// Loopback client shared by all HTTP relays.
    pub http_client: HttpClient,
}
