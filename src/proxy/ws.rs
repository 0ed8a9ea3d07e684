//! WebSocket relay — bridges a browser-facing connection to an outbound
//! connection opened against the tunnel target.
//!
//! ## Handshake binding
//!
//! The upgrade endpoint cannot carry a resolved dependency reference in its
//! handshake parameters, so binding happens in three steps:
//!
//! 1. The route handler authenticates the caller, looks the tunnel id up in
//!    the caller's merged set, and deposits `{dependency, remote path,
//!    cookies}` in the [`HandshakeStash`] under a fresh one-time ticket.
//! 2. The upgrade callback redeems the ticket — redeeming removes it, so a
//!    ticket binds at most one connection, and unredeemed tickets expire.
//! 3. The opened exchange dials the target (`ws`/`wss` mirrors the tunnel's
//!    secure flag), replaying the stashed cookies on the outbound handshake.
//!
//! ## Relay rule
//!
//! Text, binary and pong frames are forwarded verbatim, same type, in
//! arrival order. A close on one side closes the other exactly once: the
//! first direction to observe a close wins the `closing` flag and issues the
//! reactive close; the echo of that close must not re-trigger another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path as AxumPath, RawQuery, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TargetCloseFrame;
use tokio_tungstenite::tungstenite::Message as TargetMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::session::Session;
use crate::tunnel::dependency::TunnelDependency;
use crate::util;
use crate::AppState;

type TargetSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a deposited ticket stays redeemable.
const TICKET_TTL: Duration = Duration::from_secs(30);

/// Context resolved by the authenticated handshake, handed to the upgraded
/// connection.
pub struct StashedTarget {
    pub dependency: Arc<TunnelDependency>,
    /// Remote path with the original query string appended.
    pub remote_path: String,
    /// Cookies from the handshake request, replayed on the outbound hop.
    pub cookies: Vec<(String, String)>,
}

struct StashEntry {
    target: StashedTarget,
    expires_at: Instant,
}

/// One-time ticket registry carrying resolved context from the handshake
/// into the upgrade callback.
pub struct HandshakeStash {
    entries: Mutex<HashMap<String, StashEntry>>,
}

impl HandshakeStash {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Deposit a resolved target and get its one-time ticket. Expired
    /// entries are purged on the way in.
    pub fn deposit(&self, target: StashedTarget) -> String {
        let ticket = uuid::Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().expect("stash lock poisoned");
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            ticket.clone(),
            StashEntry {
                target,
                expires_at: now + TICKET_TTL,
            },
        );
        ticket
    }

    /// Redeem a ticket, removing it. Returns `None` for unknown, expired, or
    /// already-redeemed tickets.
    pub fn redeem(&self, ticket: &str) -> Option<StashedTarget> {
        let entry = self
            .entries
            .lock()
            .expect("stash lock poisoned")
            .remove(ticket)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.target)
    }

    #[cfg(test)]
    fn expire(&self, ticket: &str) {
        if let Some(entry) = self
            .entries
            .lock()
            .expect("stash lock poisoned")
            .get_mut(ticket)
        {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}

impl Default for HandshakeStash {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Route handlers ──────────────────────────────────────────────────────────

/// `GET /api/ws/{id}/{path...}` — authenticated WebSocket relay.
pub async fn ws_proxy(
    State(state): State<AppState>,
    AxumPath((id, path)): AxumPath<(u64, String)>,
    RawQuery(query): RawQuery,
    Extension(session): Extension<Arc<Session>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, session, id, path, query, headers, ws).await
}

/// `GET /api/ws/{id}` — relay with an empty remote path.
pub async fn ws_proxy_root(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
    RawQuery(query): RawQuery,
    Extension(session): Extension<Arc<Session>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, session, id, String::new(), query, headers, ws).await
}

/// Shared filter + stash + upgrade path. Also entered from the HTTP proxy
/// route for remote paths that always speak the upgrade protocol.
pub(crate) async fn upgrade(
    state: AppState,
    session: Arc<Session>,
    id: u64,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let set = match state.sessions.resolve_set(&session).await {
        Ok(set) => set,
        Err(e) => return e.into_response(),
    };
    let Some(dependency) = set.get(id).filter(|d| d.is_http() && d.tunnel().is_running()) else {
        return GatewayError::NoSuchTunnel.into_response();
    };

    let mut remote_path = path;
    if let Some(q) = query {
        if !q.is_empty() {
            remote_path.push('?');
            remote_path.push_str(&q);
        }
    }

    let ticket = state.stash.deposit(StashedTarget {
        dependency,
        remote_path,
        cookies: util::parse_cookies(&headers),
    });
    let stash = state.stash.clone();

    ws.on_upgrade(move |socket| async move {
        match stash.redeem(&ticket) {
            Some(target) => run_relay(socket, target).await,
            None => warn!("Handshake ticket vanished before upgrade"),
        }
    })
}

// ─── Exchange ────────────────────────────────────────────────────────────────

/// Dial the target and relay frames both ways until either side closes.
async fn run_relay(mut browser: WebSocket, target: StashedTarget) {
    let Some(url) = target
        .dependency
        .target_url(true, &target.remote_path, None)
    else {
        let _ = browser.send(Message::Close(None)).await;
        return;
    };

    let outbound = match connect_target(&url, &target).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(url = %url, "Outbound WebSocket failed: {e}");
            let _ = browser.send(Message::Close(None)).await;
            return;
        }
    };
    info!(
        id = target.dependency.id(),
        url = %url,
        "WebSocket exchange opened"
    );

    let (target_tx, target_rx) = outbound.split();
    let (browser_tx, browser_rx) = browser.split();
    let closing = AtomicBool::new(false);

    tokio::join!(
        pump_browser_to_target(browser_rx, target_tx, &closing),
        pump_target_to_browser(target_rx, browser_tx, &closing),
    );
    debug!(id = target.dependency.id(), "WebSocket exchange finished");
}

async fn connect_target(
    url: &str,
    target: &StashedTarget,
) -> Result<TargetSocket, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    if !target.cookies.is_empty() {
        let raw = util::format_cookie_header(&target.cookies);
        if let Ok(value) = HeaderValue::from_str(&raw) {
            request.headers_mut().insert(header::COOKIE, value);
        }
    }
    let origin = format!("http://localhost:{}", target.dependency.local_port());
    if let Ok(value) = HeaderValue::from_str(&origin) {
        request.headers_mut().insert(header::ORIGIN, value);
    }

    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

/// Browser → target direction. Forwards text/binary/pong verbatim; a close
/// (or abrupt end) closes the target once, guarded by `closing`.
async fn pump_browser_to_target(
    mut browser_rx: SplitStream<WebSocket>,
    mut target_tx: SplitSink<TargetSocket, TargetMessage>,
    closing: &AtomicBool,
) {
    while let Some(next) = browser_rx.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Browser socket error: {e}");
                break;
            }
        };
        let forward = match msg {
            Message::Text(text) => TargetMessage::Text(text.as_str().into()),
            Message::Binary(data) => TargetMessage::Binary(data),
            Message::Pong(data) => TargetMessage::Pong(data),
            // Pings are answered locally by the receiving endpoint.
            Message::Ping(_) => continue,
            Message::Close(frame) => {
                if !closing.swap(true, Ordering::SeqCst) {
                    let _ = target_tx
                        .send(TargetMessage::Close(close_to_target(frame)))
                        .await;
                }
                return;
            }
        };
        if target_tx.send(forward).await.is_err() {
            return;
        }
    }
    // Stream ended without a close frame (browser disconnect surfaces as an
    // I/O error): still close the peer, once.
    if !closing.swap(true, Ordering::SeqCst) {
        let _ = target_tx.send(TargetMessage::Close(None)).await;
    }
}

/// Target → browser direction, mirror of [`pump_browser_to_target`].
async fn pump_target_to_browser(
    mut target_rx: SplitStream<TargetSocket>,
    mut browser_tx: SplitSink<WebSocket, Message>,
    closing: &AtomicBool,
) {
    while let Some(next) = target_rx.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Target socket error: {e}");
                break;
            }
        };
        let forward = match msg {
            TargetMessage::Text(text) => Message::Text(text.as_str().into()),
            TargetMessage::Binary(data) => Message::Binary(data),
            TargetMessage::Pong(data) => Message::Pong(data),
            TargetMessage::Ping(_) => continue,
            TargetMessage::Close(frame) => {
                if !closing.swap(true, Ordering::SeqCst) {
                    let _ = browser_tx
                        .send(Message::Close(close_to_browser(frame)))
                        .await;
                }
                return;
            }
            TargetMessage::Frame(_) => continue,
        };
        if browser_tx.send(forward).await.is_err() {
            return;
        }
    }
    if !closing.swap(true, Ordering::SeqCst) {
        let _ = browser_tx.send(Message::Close(None)).await;
    }
}

fn close_to_target(frame: Option<CloseFrame>) -> Option<TargetCloseFrame> {
    frame.map(|f| TargetCloseFrame {
        code: CloseCode::from(f.code),
        reason: f.reason.as_str().into(),
    })
}

fn close_to_browser(frame: Option<TargetCloseFrame>) -> Option<CloseFrame> {
    frame.map(|f| CloseFrame {
        code: f.code.into(),
        reason: f.reason.as_str().into(),
    })
}
