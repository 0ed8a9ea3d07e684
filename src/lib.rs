#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! passage — web gateway for remote compute services.
//!
//! Browser clients reach services running on remote compute/login nodes
//! (web UIs, remote-desktop servers, kernel consoles) through SSH-backed
//! local port forwards that passage re-exposes as HTTP and WebSocket
//! endpoints on its own origin, with headers and cookies rewritten so the
//! browser's same-origin rules are satisfied.
//!
//! Key building blocks:
//! - `ssh` — SSH collaborator: opens forwards, hands out tunnel handles
//! - `tunnel` — dependency data model + process-wide registry and reaper
//! - `session` — browser sessions, identities, cross-session tunnel sets
//! - `proxy` — HTTP and WebSocket relays plus the stream copier
//! - `routes` — REST API route handlers and router assembly
//! - `auth` — session-cookie middleware and identity guard
//! - `config` — configuration loading

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod routes;
pub mod session;
pub mod ssh;
pub mod state;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::GatewayError;
pub use session::SessionStore;
pub use state::AppState;
pub use tunnel::registry::TunnelRegistry;
