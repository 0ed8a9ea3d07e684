//! # passage
//!
//! Web gateway for remote compute services.
//!
//! passage lets browser clients reach services on remote compute/login nodes
//! by opening SSH-backed local port forwards and re-exposing each forward as
//! an HTTP or WebSocket endpoint on the gateway's own origin.
//!
//! ## API surface
//!
//! | Method | Path                        | Auth     | Description                        |
//! |--------|-----------------------------|----------|------------------------------------|
//! | GET    | `/api/health`               | No       | Liveness probe                     |
//! | POST   | `/api/session/identity`     | session  | Attach authenticated identity      |
//! | GET    | `/api/session`              | identity | Session and identity info          |
//! | DELETE | `/api/session`              | identity | End session, stop its tunnels      |
//! | POST   | `/api/tunnels/http`         | identity | Start (or dedup) an HTTP tunnel    |
//! | GET    | `/api/tunnels/http`         | identity | List HTTP tunnels                  |
//! | DELETE | `/api/tunnels/http/{id}`    | identity | Stop an HTTP tunnel                |
//! | POST   | `/api/tunnels/desktop`      | identity | Start (or rename) a desktop session|
//! | GET    | `/api/tunnels/desktop`      | identity | List desktop sessions              |
//! | DELETE | `/api/tunnels/desktop/{id}` | identity | Stop a desktop session             |
//! | any    | `/api/proxy/{id}/{path}`    | identity | HTTP relay under a tunnel          |
//! | GET    | `/api/ws/{id}/{path}`       | identity | WebSocket relay under a tunnel     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, router setup, reaper, shutdown
//! auth.rs        — session-cookie middleware, identity guard
//! config.rs      — TOML + env-var configuration
//! ssh.rs         — forked ssh client, tunnel handles
//! session/       — session store, identity attachment, tunnel-set merge
//! tunnel/        — dependency model, registry, dedup, reaping
//! proxy/         — HTTP relay, WebSocket relay + handshake stash, copier
//! routes/        — REST handlers and router assembly
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use passage::proxy::http::build_client;
use passage::proxy::ws::HandshakeStash;
use passage::ssh::ForkedSshClient;
use passage::{AppState, Config, SessionStore, TunnelRegistry};

/// Web gateway for remote compute services.
#[derive(Parser)]
#[command(name = "passage", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("passage v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("SSH key: {}", config.ssh.key_path);

    let forwarder = Arc::new(ForkedSshClient::new(config.ssh.clone()));
    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        sessions: Arc::new(SessionStore::new()),
        registry: Arc::new(TunnelRegistry::new(forwarder)),
        stash: Arc::new(HandshakeStash::new()),
        http_client: build_client(),
    };

    let app = passage::routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Reaper: one dedicated task, so sweeps are never concurrent even when
    // a sweep overruns the interval.
    let registry = state.registry.clone();
    let reap_interval = Duration::from_secs(state.config.reaper.interval_secs);
    let reaper_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_interval);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            registry.reap();
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    reaper_task.abort();
    state.registry.drain_all();
    info!("Goodbye");
}
