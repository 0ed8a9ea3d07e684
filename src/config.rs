//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PASSAGE_LISTEN`, `PASSAGE_SSH_KEY`,
//!    `PASSAGE_DEFAULT_GATEWAY`
//! 2. **Config file** — path via `--config <path>`, or `passage.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8090"
//! session_cookie = "passage_sid"
//!
//! [ssh]
//! binary = "ssh"
//! key_path = "/etc/passage/id_ed25519"
//! connect_timeout_ms = 10000
//!
//! [proxy]
//! ws_prefix = "api/kernels/"       # always relayed as WebSocket, never plain HTTP
//! default_gateway = "login.example.org"  # optional login host for indirect tunnels
//!
//! [reaper]
//! interval_secs = 5
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8090`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Name of the HttpOnly session cookie (default `passage_sid`).
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
}

/// SSH forward settings for the forked client.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// SSH binary to fork (default `ssh`, resolved via `PATH`).
    #[serde(default = "default_ssh_binary")]
    pub binary: String,
    /// Private key (or certificate) used for all forwards. Override with
    /// `PASSAGE_SSH_KEY`.
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// How long to wait for the forward to accept connections (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Relay behavior settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Remote-path prefix that always goes through the WebSocket relay, never
    /// plain HTTP (default `api/kernels/` — the target speaks the upgrade
    /// protocol on that path).
    #[serde(default = "default_ws_prefix")]
    pub ws_prefix: String,
    /// Login host used as the tunnel gateway when a start request names a
    /// target host but no gateway. When unset, the target host itself becomes
    /// the gateway and the forward terminates at its loopback.
    pub default_gateway: Option<String>,
}

/// Reaper settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between liveness sweeps over the tunnel registry (default 5).
    #[serde(default = "default_reap_interval")]
    pub interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8090".to_string()
}
fn default_session_cookie() -> String {
    "passage_sid".to_string()
}
fn default_ssh_binary() -> String {
    "ssh".to_string()
}
fn default_key_path() -> String {
    "/etc/passage/id_ed25519".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10000
}
fn default_ws_prefix() -> String {
    "api/kernels/".to_string()
}
fn default_reap_interval() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            session_cookie: default_session_cookie(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            key_path: default_key_path(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ws_prefix: default_ws_prefix(),
            default_gateway: None,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reap_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `passage.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("passage.toml").exists() {
            let content =
                std::fs::read_to_string("passage.toml").expect("Failed to read passage.toml");
            toml::from_str(&content).expect("Failed to parse passage.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                ssh: SshConfig::default(),
                proxy: ProxyConfig::default(),
                reaper: ReaperConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("PASSAGE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(key) = std::env::var("PASSAGE_SSH_KEY") {
            config.ssh.key_path = key;
        }
        if let Ok(gw) = std::env::var("PASSAGE_DEFAULT_GATEWAY") {
            config.proxy.default_gateway = Some(gw);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8090");
        assert_eq!(config.proxy.ws_prefix, "api/kernels/");
        assert_eq!(config.reaper.interval_secs, 5);
        assert!(config.proxy.default_gateway.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            default_gateway = "login.example.org"
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.default_gateway.as_deref(), Some("login.example.org"));
        assert_eq!(config.ssh.binary, "ssh");
    }
}
