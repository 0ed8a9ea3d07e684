//! The relay layer — one HTTP or WebSocket exchange per invocation, streamed
//! without full buffering, never retried.

pub mod copier;
pub mod http;
pub mod ws;
