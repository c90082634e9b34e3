//! Daemon Server Implementation
//!
//! This module provides the accept loop for the bridge daemon:
//! - Accepts TCP connections and hands each one to the gateway
//! - Tracks active connections and enforces the connection limit
//! - Supports graceful shutdown, tearing down every Session
//! - Handles config reload signals
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!    /recognition        /chat        /recognition
//!     (peer A)         (peer B)         (peer C)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                  WorkerSupervisor
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use bridge_core::{
    default_config_path, load_config_from_path, BridgeConfig, ConfigOverrides, Gateway,
    WorkerSupervisor,
};

/// How long one accept wait lasts before the shutdown flag is checked again
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// The connection task
    task: JoinHandle<()>,
}

/// The main daemon server
pub struct DaemonServer {
    /// Effective configuration
    config: BridgeConfig,
    /// Configuration file to reload from
    config_path: Option<PathBuf>,
    /// CLI overrides, re-applied on every reload
    overrides: ConfigOverrides,
    /// Gateway for new connections
    gateway: Gateway,
    /// Active connection state, keyed by peer address
    connection_states: Arc<DashMap<SocketAddr, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server that spawns real worker processes
    pub fn new(
        config: BridgeConfig,
        config_path: Option<PathBuf>,
        overrides: ConfigOverrides,
    ) -> Self {
        let supervisor = WorkerSupervisor::with_process_launcher(config.supervisor_config());
        let gateway = Gateway::new(supervisor, config.gateway_config());
        Self {
            config,
            config_path,
            overrides,
            gateway,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// The supervisor owning every Session
    pub fn supervisor(&self) -> &WorkerSupervisor {
        self.gateway.supervisor()
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(
        &mut self,
        shutdown: Arc<AtomicBool>,
        reload_config: Arc<AtomicBool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_address))?;

        self.serve(listener, shutdown, reload_config).await
    }

    /// Run the accept loop on an already bound listener
    pub async fn serve(
        &mut self,
        listener: TcpListener,
        shutdown: Arc<AtomicBool>,
        reload_config: Arc<AtomicBool>,
    ) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        info!(address = %local_addr, "Listening for connections");

        loop {
            // Check for shutdown
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Check for config reload
            if reload_config.swap(false, Ordering::SeqCst) {
                info!("Config reload requested");
                self.reload_config();
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result = tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await;

            let (stream, peer) = match accept_result {
                Ok(Ok((stream, peer))) => (stream, peer),
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => {
                    // Timeout, loop back to check shutdown
                    continue;
                }
            };

            // Check connection limit
            if self.connection_states.len() >= self.config.max_connections {
                warn!(
                    peer = %peer,
                    max_connections = self.config.max_connections,
                    "Connection limit reached, rejecting new connection"
                );
                drop(stream);
                continue;
            }

            info!(
                peer = %peer,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            // The handler waits until its state is registered, so its own
            // removal can never run first
            let (registered_tx, registered_rx) = oneshot::channel::<()>();
            let gateway = self.gateway.clone();
            let connection_states = Arc::clone(&self.connection_states);

            let task_handle = tokio::spawn(
                async move {
                    if registered_rx.await.is_err() {
                        return;
                    }
                    if let Err(e) = gateway.serve_connection(stream).await {
                        debug!(error = %e, "Connection ended before a session was opened");
                    }
                    connection_states.remove(&peer);
                    debug!(
                        active_connections = connection_states.len(),
                        "Connection handler finished"
                    );
                }
                .instrument(tracing::info_span!("connection", %peer)),
            );

            self.connection_states.insert(
                peer,
                ConnectionState {
                    connected_at: Instant::now(),
                    task: task_handle,
                },
            );
            let _ = registered_tx.send(());
        }

        // Graceful shutdown
        self.shutdown().await;
        Ok(())
    }

    /// Reload configuration from file
    ///
    /// Worker and gateway settings apply to connections accepted afterwards.
    /// A file that fails to load leaves the running configuration in place.
    fn reload_config(&mut self) {
        let path = self.config_path.clone().or_else(default_config_path);
        info!(path = ?path, "Reloading configuration");

        let mut config = match load_config_from_path(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Config reload failed, keeping current configuration");
                return;
            }
        };
        self.overrides.apply(&mut config);
        if let Err(e) = config.validate() {
            error!(error = %e, "Reloaded configuration is invalid, keeping current configuration");
            return;
        }

        if config.bind_address != self.config.bind_address {
            warn!(
                current = %self.config.bind_address,
                requested = %config.bind_address,
                "bind_address changes need a restart"
            );
        }

        let supervisor = self.gateway.supervisor().clone();
        supervisor.update_config(config.supervisor_config());
        self.gateway = Gateway::new(supervisor, config.gateway_config());
        self.config = config;

        info!(source = %self.config.source(), "Configuration reloaded");
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");

        // Abort all connection handlers
        let peers: Vec<SocketAddr> = self.connection_states.iter().map(|r| *r.key()).collect();
        let mut tasks = Vec::with_capacity(peers.len());
        for peer in peers {
            if let Some((_, conn_state)) = self.connection_states.remove(&peer) {
                debug!(
                    peer = %peer,
                    uptime_secs = conn_state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                conn_state.task.abort();
                tasks.push(conn_state.task);
            }
        }

        // Handlers stop at their next await and may open a Session first
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Connection handler panicked");
                }
            }
        }

        // Aborted handlers never reach their own teardown
        let stopped = self.gateway.supervisor().shutdown();

        // Wait a bit for workers to exit
        tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;

        info!(sessions_stopped = stopped, "Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    fn echo_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        let script = r#"while read -r line; do printf '%s\n' "$line"; done"#;
        let args = vec!["-c".to_string(), script.to_string(), "worker".to_string()];
        config.recognition_program = "/bin/sh".to_string();
        config.recognition_args = args.clone();
        config.chat_program = "/bin/sh".to_string();
        config.chat_args = args;
        config.restart_backoff = Duration::from_millis(20);
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    async fn start(
        server: DaemonServer,
    ) -> (
        SocketAddr,
        Arc<AtomicBool>,
        Arc<AtomicBool>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));

        let (s, r) = (Arc::clone(&shutdown), Arc::clone(&reload));
        let handle = tokio::spawn(async move {
            let mut server = server;
            server.serve(listener, s, r).await
        });
        (addr, shutdown, reload, handle)
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_sessions() {
        let server = DaemonServer::new(echo_config(), None, ConfigOverrides::new());
        let supervisor = server.supervisor().clone();
        let (addr, shutdown, _reload, handle) = start(server).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/chat")).await.unwrap();
        let first = ws.next().await.unwrap().unwrap();
        assert!(matches!(first, Message::Text(ref text) if text.contains("Connected to chat")));
        assert_eq!(supervisor.session_count(), 1);

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
        assert_eq!(supervisor.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_handshakes_leaves_no_sessions() {
        let server = DaemonServer::new(echo_config(), None, ConfigOverrides::new());
        let supervisor = server.supervisor().clone();
        let (addr, shutdown, _reload, handle) = start(server).await;

        let mut clients = Vec::new();
        for i in 0..8 {
            let path = if i % 2 == 0 { "/chat" } else { "/recognition" };
            clients.push(tokio::spawn(connect_async(format!("ws://{addr}{path}"))));
        }
        // Stop while handlers are still opening their Sessions
        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();

        assert_eq!(supervisor.session_count(), 0);
        for client in clients {
            let _ = client.await;
        }
        assert_eq!(supervisor.session_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_extra_clients() {
        let mut config = echo_config();
        config.max_connections = 1;
        let server = DaemonServer::new(config, None, ConfigOverrides::new());
        let supervisor = server.supervisor().clone();
        let (addr, shutdown, _reload, handle) = start(server).await;

        let (mut first, _) = connect_async(format!("ws://{addr}/recognition"))
            .await
            .unwrap();
        let _connected = first.next().await.unwrap().unwrap();

        let second = connect_async(format!("ws://{addr}/recognition")).await;
        assert!(second.is_err());
        assert_eq!(supervisor.session_count(), 1);

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_frees_connection_slot() {
        let server = DaemonServer::new(echo_config(), None, ConfigOverrides::new());
        let supervisor = server.supervisor().clone();
        let (addr, shutdown, _reload, handle) = start(server).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/chat")).await.unwrap();
        let _connected = ws.next().await.unwrap().unwrap();
        ws.close(None).await.unwrap();
        drop(ws);

        assert!(wait_until(|| supervisor.session_count() == 0).await);

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reload_updates_worker_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[worker]\nstore_path = \"/srv/reloaded.db\"\nrestart_backoff_ms = 75"
        )
        .unwrap();

        let server = DaemonServer::new(
            echo_config(),
            Some(file.path().to_path_buf()),
            ConfigOverrides::new(),
        );
        let supervisor = server.supervisor().clone();
        let (_addr, shutdown, reload, handle) = start(server).await;

        reload.store(true, Ordering::SeqCst);
        assert!(
            wait_until(|| supervisor.config().restart_backoff == Duration::from_millis(75)).await
        );
        assert_eq!(
            supervisor.config().store_path,
            PathBuf::from("/srv/reloaded.db")
        );

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reload_keeps_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nstore_path = \"/srv/from-file.db\"").unwrap();

        let overrides = ConfigOverrides::new().with_store_path(PathBuf::from("/srv/from-cli.db"));
        let server = DaemonServer::new(
            echo_config(),
            Some(file.path().to_path_buf()),
            overrides,
        );
        let supervisor = server.supervisor().clone();
        let (_addr, shutdown, reload, handle) = start(server).await;

        reload.store(true, Ordering::SeqCst);
        tokio::time::sleep(ACCEPT_POLL_INTERVAL * 3).await;
        assert_eq!(
            supervisor.config().store_path,
            PathBuf::from("/srv/from-cli.db")
        );

        shutdown.store(true, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }
}
