//! Gateway error taxonomy.
//!
//! Every error is local to one exchange; none halt the process. The reaper
//! never raises — it only logs and converges registry state.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

/// Errors surfaced by the tunnel registry and the relay layer.
#[derive(Debug)]
pub enum GatewayError {
    /// The SSH layer failed to open the forward. Fatal to the initiating
    /// call; nothing is registered.
    TunnelEstablishment(String),
    /// The referenced tunnel id is absent from the caller's set, or its
    /// backing forward is no longer running. Never retried automatically.
    NoSuchTunnel,
    /// A socket or stream failed mid-exchange. The relay terminates; the
    /// registry converges later via the reaper.
    RelayIo(String),
    /// The session carries no authenticated identity.
    Unauthorized,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::TunnelEstablishment(_) | GatewayError::RelayIo(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::NoSuchTunnel => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::TunnelEstablishment(_) => "TUNNEL_ESTABLISHMENT_FAILED",
            GatewayError::NoSuchTunnel => "NO_SUCH_TUNNEL",
            GatewayError::RelayIo(_) => "RELAY_IO",
            GatewayError::Unauthorized => "NO_IDENTITY",
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::TunnelEstablishment(e) => write!(f, "Failed to establish tunnel: {e}"),
            GatewayError::NoSuchTunnel => write!(f, "No active tunnel found by supplied id"),
            GatewayError::RelayIo(e) => write!(f, "Relay I/O error: {e}"),
            GatewayError::Unauthorized => write!(f, "No authenticated identity on session"),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}
