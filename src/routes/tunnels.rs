//! REST endpoints for starting, stopping and listing tunnels.
//!
//! - `POST   /api/tunnels/http`          — start (or dedup-hit) an HTTP tunnel
//! - `GET    /api/tunnels/http`          — list the caller's HTTP tunnels
//! - `DELETE /api/tunnels/http/{id}`     — stop an HTTP tunnel
//! - `POST   /api/tunnels/desktop`       — start (or rename) a desktop session
//! - `GET    /api/tunnels/desktop`       — list the caller's desktop sessions
//! - `DELETE /api/tunnels/desktop/{id}`  — stop a desktop session
//!
//! All endpoints operate on the caller's merged session set; a tunnel
//! started in one browser tab is visible from every other tab of the same
//! identity.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::session::Session;
use crate::ssh::Credential;
use crate::tunnel::registry::{DesktopSpec, HttpTunnelSpec};
use crate::AppState;

/// VNC displays are numbered from this base port.
const VNC_BASE_PORT: u16 = 5900;

fn default_remote_port() -> u16 {
    80
}
fn default_root() -> String {
    "/".to_string()
}

#[derive(Deserialize)]
pub struct StartHttpRequest {
    pub remote_host: String,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub rewrite_html: bool,
    pub via_gateway: Option<String>,
}

#[derive(Deserialize)]
pub struct StartDesktopRequest {
    pub desktop_name: String,
    pub password: String,
    pub remote_host: String,
    pub display: u16,
    pub via_gateway: Option<String>,
}

/// Decide where the forward terminates. With an explicit or configured
/// gateway the target host is reached from it; otherwise the target host
/// itself becomes the gateway and the forward lands on its loopback.
fn infer_gateway(state: &AppState, via_gateway: Option<String>, remote_host: String) -> (String, String) {
    match via_gateway {
        Some(gateway) => (gateway, remote_host),
        None => match &state.config.proxy.default_gateway {
            Some(login_host) => (login_host.clone(), remote_host),
            None => (remote_host, "localhost".to_string()),
        },
    }
}

fn credential(state: &AppState, session: &Session) -> Result<Credential, GatewayError> {
    let identity = session.identity().ok_or(GatewayError::Unauthorized)?;
    Ok(Credential {
        username: identity.username,
        key_path: state.config.ssh.key_path.clone().into(),
    })
}

/// `POST /api/tunnels/http` — start an HTTP tunnel, or return the existing
/// one for the same target (idempotent).
pub async fn start_http(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Json(payload): Json<StartHttpRequest>,
) -> Result<Json<Value>, GatewayError> {
    let set = state.sessions.resolve_set(&session).await?;
    let credential = credential(&state, &session)?;
    let (via_gateway, remote_host) =
        infer_gateway(&state, payload.via_gateway, payload.remote_host);

    let dependency = state
        .registry
        .start_http(
            &credential,
            HttpTunnelSpec {
                via_gateway,
                remote_host,
                remote_port: payload.remote_port,
                root: payload.root,
                secure: payload.secure,
                rewrite_html: payload.rewrite_html,
            },
            &set,
        )
        .await?;

    Ok(Json(json!({"id": dependency.id()})))
}

/// `GET /api/tunnels/http` — list the caller's HTTP tunnels.
pub async fn list_http(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
) -> Result<Json<Value>, GatewayError> {
    let set = state.sessions.resolve_set(&session).await?;
    let tunnels: Vec<Value> = set
        .members()
        .iter()
        .filter(|d| d.is_http())
        .map(|d| {
            json!({
                "id": d.id(),
                "remote_host": d.tunnel().remote_host(),
                "remote_port": d.tunnel().remote_port(),
                "local_port": d.local_port(),
            })
        })
        .collect();
    Ok(Json(json!({"tunnels": tunnels})))
}

/// `DELETE /api/tunnels/http/{id}` — stop an HTTP tunnel.
pub async fn stop_http(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, GatewayError> {
    let set = state.sessions.resolve_set(&session).await?;
    let dependency = set
        .get(id)
        .filter(|d| d.is_http())
        .ok_or(GatewayError::NoSuchTunnel)?;
    state.registry.stop(&dependency);
    Ok(Json(json!({"message": "tunnel stopped"})))
}

/// `POST /api/tunnels/desktop` — start a desktop session, or rename the
/// existing one for the same target.
pub async fn start_desktop(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Json(payload): Json<StartDesktopRequest>,
) -> Result<Json<Value>, GatewayError> {
    let set = state.sessions.resolve_set(&session).await?;
    let credential = credential(&state, &session)?;
    let (via_gateway, remote_host) =
        infer_gateway(&state, payload.via_gateway, payload.remote_host);

    let dependency = state
        .registry
        .start_desktop(
            &credential,
            DesktopSpec {
                via_gateway,
                remote_host,
                remote_port: VNC_BASE_PORT + payload.display,
                display_name: payload.desktop_name,
                password: payload.password,
                protocol: "vnc".to_string(),
            },
            &set,
        )
        .await?;

    let meta = dependency
        .desktop_meta()
        .expect("start_desktop yields a desktop dependency");
    Ok(Json(json!({
        "id": dependency.id(),
        "desktop_name": meta.display_name,
        "local_port": dependency.local_port(),
    })))
}

/// `GET /api/tunnels/desktop` — list the caller's desktop sessions.
pub async fn list_desktop(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
) -> Result<Json<Value>, GatewayError> {
    let set = state.sessions.resolve_set(&session).await?;
    let sessions: Vec<Value> = set
        .members()
        .iter()
        .filter_map(|d| {
            let meta = d.desktop_meta()?;
            Some(json!({
                "id": d.id(),
                "desktop_name": meta.display_name,
                "password": meta.password,
                "local_port": d.local_port(),
            }))
        })
        .collect();
    Ok(Json(json!({"sessions": sessions})))
}

/// `DELETE /api/tunnels/desktop/{id}` — stop a desktop session.
pub async fn stop_desktop(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, GatewayError> {
    let set = state.sessions.resolve_set(&session).await?;
    let dependency = set
        .get(id)
        .filter(|d| d.is_desktop())
        .ok_or(GatewayError::NoSuchTunnel)?;
    state.registry.stop(&dependency);
    Ok(Json(json!({"message": "session deleted"})))
}
