//! SSH collaborator — opens local port forwards by forking the system `ssh`.
//!
//! The tunnel core never creates a forward itself; it asks a [`Forwarder`]
//! for one and consumes the returned [`Tunnel`] handle. Production uses
//! [`ForkedSshClient`], which spawns `ssh -N -L` with `kill_on_drop(true)` so
//! orphaned forwards are cleaned up if the owning task is cancelled.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::SshConfig;

/// Interval between readiness probes against the local end of a new forward.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Per-identity SSH credential used to open forwards.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Remote username (from the session's authenticated identity).
    pub username: String,
    /// Private key or certificate presented to the gateway.
    pub key_path: PathBuf,
}

/// Parameters for one local port forward.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// SSH host the forward is established through.
    pub via_gateway: String,
    /// Target host as seen from the gateway (`localhost` for forwards that
    /// terminate on the gateway itself).
    pub remote_host: String,
    /// Target port as seen from the gateway.
    pub remote_port: u16,
}

/// Something that can open SSH-backed local port forwards.
///
/// Object-safe so the registry can hold `Arc<dyn Forwarder>` and tests can
/// substitute a mock.
pub trait Forwarder: Send + Sync {
    fn open_forward<'a>(
        &'a self,
        credential: &'a Credential,
        request: ForwardRequest,
    ) -> BoxFuture<'a, Result<Tunnel, ForwardError>>;
}

/// Errors opening a forward.
#[derive(Debug)]
pub enum ForwardError {
    /// The ssh binary could not be started.
    Spawn(String),
    /// ssh exited before the forward came up.
    Exited(String),
    /// The forward never accepted connections within the timeout.
    Timeout(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Spawn(e) => write!(f, "Failed to spawn ssh: {e}"),
            ForwardError::Exited(e) => write!(f, "ssh exited during forward setup: {e}"),
            ForwardError::Timeout(e) => write!(f, "Forward did not come up: {e}"),
        }
    }
}

// ─── Tunnel handle ───────────────────────────────────────────────────────────

/// An established local port forward.
///
/// The handle is read-mostly: the core observes `local_port`/`remote_host`/
/// `remote_port` and `is_running()`, and calls `stop()` exactly when retiring
/// the forward. `stop()` marks the tunnel not running immediately; the monitor
/// task owning the ssh process reaps it in the background.
pub struct Tunnel {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Tunnel {
    /// Wrap an established forward. `running` is shared with whatever task
    /// monitors the forward's real liveness; `stop_tx` tears it down.
    pub fn handle(
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        running: Arc<AtomicBool>,
        stop_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            local_port,
            remote_host,
            remote_port,
            running,
            stop_tx: Mutex::new(Some(stop_tx)),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Tear the forward down. Idempotent; repeated calls are no-ops.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let sender = self.stop_tx.lock().expect("stop_tx lock poisoned").take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("running", &self.is_running())
            .finish()
    }
}

// ─── Forked ssh client ───────────────────────────────────────────────────────

/// Opens forwards by forking `ssh -N -L <local>:<host>:<port> user@gateway`.
pub struct ForkedSshClient {
    config: SshConfig,
}

impl ForkedSshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Reserve an ephemeral loopback port by binding and immediately dropping
    /// a listener. The port stays free long enough for ssh to claim it.
    fn allocate_local_port() -> std::io::Result<u16> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}

impl Forwarder for ForkedSshClient {
    fn open_forward<'a>(
        &'a self,
        credential: &'a Credential,
        request: ForwardRequest,
    ) -> BoxFuture<'a, Result<Tunnel, ForwardError>> {
        Box::pin(async move {
            let local_port =
                Self::allocate_local_port().map_err(|e| ForwardError::Spawn(e.to_string()))?;

            let mut child = Command::new(&self.config.binary)
                .arg("-i")
                .arg(&credential.key_path)
                .arg("-o")
                .arg("BatchMode=yes")
                .arg("-o")
                .arg("ExitOnForwardFailure=yes")
                .arg("-o")
                .arg("StrictHostKeyChecking=no")
                .arg("-N")
                .arg("-L")
                .arg(format!(
                    "127.0.0.1:{local_port}:{}:{}",
                    request.remote_host, request.remote_port
                ))
                .arg(format!("{}@{}", credential.username, request.via_gateway))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ForwardError::Spawn(e.to_string()))?;

            // Wait until the local end accepts connections, or ssh gives up.
            let deadline = tokio::time::Instant::now()
                + Duration::from_millis(self.config.connect_timeout_ms);
            loop {
                if let Ok(Some(status)) = child.try_wait() {
                    let mut detail = String::new();
                    if let Some(mut stderr) = child.stderr.take() {
                        let _ = stderr.read_to_string(&mut detail).await;
                    }
                    let detail = detail.trim();
                    warn!(
                        gateway = %request.via_gateway,
                        "ssh exited with {status} during forward setup: {detail}"
                    );
                    return Err(ForwardError::Exited(if detail.is_empty() {
                        status.to_string()
                    } else {
                        detail.to_string()
                    }));
                }
                if TcpStream::connect(("127.0.0.1", local_port)).await.is_ok() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    let _ = child.start_kill();
                    return Err(ForwardError::Timeout(format!(
                        "127.0.0.1:{local_port} not accepting after {}ms",
                        self.config.connect_timeout_ms
                    )));
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }

            info!(
                local_port,
                remote_host = %request.remote_host,
                remote_port = request.remote_port,
                gateway = %request.via_gateway,
                "Forward established"
            );

            let running = Arc::new(AtomicBool::new(true));
            let (stop_tx, stop_rx) = oneshot::channel();

            // Monitor task: owns the child, reaps it on exit or stop signal.
            let monitor_flag = running.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        debug!(local_port, "ssh forward exited: {:?}", status);
                    }
                    _ = stop_rx => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        debug!(local_port, "ssh forward stopped");
                    }
                }
                monitor_flag.store(false, Ordering::Relaxed);
            });

            Ok(Tunnel::handle(
                local_port,
                request.remote_host,
                request.remote_port,
                running,
                stop_tx,
            ))
        })
    }
}

// ─── Test support ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicU16;

    /// Forwarder that hands out tunnels without any process behind them.
    /// `running` flags are retained so tests can simulate forward death.
    pub struct MockForwarder {
        next_port: AtomicU16,
        pub opened: Mutex<Vec<(String, String, u16)>>,
        pub flags: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl MockForwarder {
        pub fn new(first_port: u16) -> Self {
            Self {
                next_port: AtomicU16::new(first_port),
                opened: Mutex::new(Vec::new()),
                flags: Mutex::new(Vec::new()),
            }
        }

        pub fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        /// Running flag of the n-th opened tunnel.
        pub fn flag(&self, n: usize) -> Arc<AtomicBool> {
            self.flags.lock().unwrap()[n].clone()
        }
    }

    impl Forwarder for MockForwarder {
        fn open_forward<'a>(
            &'a self,
            _credential: &'a Credential,
            request: ForwardRequest,
        ) -> BoxFuture<'a, Result<Tunnel, ForwardError>> {
            Box::pin(async move {
                let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                let running = Arc::new(AtomicBool::new(true));
                let (stop_tx, _stop_rx) = oneshot::channel();
                self.opened.lock().unwrap().push((
                    request.via_gateway.clone(),
                    request.remote_host.clone(),
                    request.remote_port,
                ));
                self.flags.lock().unwrap().push(running.clone());
                Ok(Tunnel::handle(
                    port,
                    request.remote_host,
                    request.remote_port,
                    running,
                    stop_tx,
                ))
            })
        }
    }

    /// Forwarder that always fails, for establishment-error paths.
    pub struct FailingForwarder;

    impl Forwarder for FailingForwarder {
        fn open_forward<'a>(
            &'a self,
            _credential: &'a Credential,
            _request: ForwardRequest,
        ) -> BoxFuture<'a, Result<Tunnel, ForwardError>> {
            Box::pin(async move { Err(ForwardError::Exited("connection refused".to_string())) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_stop_is_idempotent() {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = oneshot::channel();
        let tunnel = Tunnel::handle(9001, "vis.example.org".to_string(), 8888, running, tx);

        assert!(tunnel.is_running());
        tunnel.stop();
        assert!(!tunnel.is_running());
        tunnel.stop();
        assert!(!tunnel.is_running());
    }

    #[test]
    fn test_allocate_local_port_is_nonzero() {
        let port = ForkedSshClient::allocate_local_port().unwrap();
        assert_ne!(port, 0);
    }
}
