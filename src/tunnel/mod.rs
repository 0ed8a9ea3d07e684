//! Tunnel lifecycle — the dependency data model and the process-wide
//! registry that owns allocation, dedup, explicit stop, and reaping.

pub mod dependency;
pub mod registry;
