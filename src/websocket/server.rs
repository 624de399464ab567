use super::config::WsConfig;
use super::handler::ConnectionHandler;
use super::upgrade::{self, UpgradeError};
use crate::common::EchoServerTrait;
use crate::security::{ConnectionMetrics, ConnectionTracker};
use crate::{EchoError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Over-limit connections answered with 503 at the same time
const MAX_PENDING_REJECTIONS: usize = 64;

/// Longest wait for the request head of an over-limit connection
const REJECT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket echo server
///
/// Accepts TCP connections, upgrades requests for the configured path and
/// echoes every message back to its sender. Each connection runs in its own
/// task; the number of concurrent connections is bounded by
/// `limits.max_concurrent_connections`.
///
/// # Examples
///
/// Basic server setup and running:
///
/// ```no_run
/// use wsecho::common::EchoServerTrait;
/// use wsecho::websocket::{WsConfig, WsEchoServer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = WsConfig {
///         bind_addr: "127.0.0.1:8080".parse()?,
///         ..Default::default()
///     };
///
///     let server = WsEchoServer::new(config);
///     server.run().await?;
///     Ok(())
/// }
/// ```
///
/// Server with graceful shutdown:
///
/// ```no_run
/// use wsecho::common::EchoServerTrait;
/// use wsecho::websocket::{WsConfig, WsEchoServer};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Arc::new(WsEchoServer::new(WsConfig::default()));
///     let shutdown_signal = server.shutdown_signal();
///
///     let server_handle = {
///         let server = Arc::clone(&server);
///         tokio::spawn(async move { server.run().await })
///     };
///
///     // Do other work...
///
///     shutdown_signal.cancel();
///     server_handle.await??;
///     Ok(())
/// }
/// ```
pub struct WsEchoServer {
    config: Arc<WsConfig>,
    tracker: Arc<ConnectionTracker>,
    rejections: Arc<Semaphore>,
    shutdown_signal: CancellationToken,
}

impl WsEchoServer {
    /// Creates a new WebSocket echo server with the given configuration
    pub fn new(config: WsConfig) -> Self {
        Self {
            tracker: Arc::new(ConnectionTracker::new(&config.limits)),
            config: Arc::new(config),
            rejections: Arc::new(Semaphore::new(MAX_PENDING_REJECTIONS)),
            shutdown_signal: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Live connection counts
    pub fn metrics(&self) -> ConnectionMetrics {
        self.tracker.metrics()
    }

    /// Stops accepting and closes open connections
    pub fn shutdown(&self) {
        self.shutdown_signal.cancel();
    }

    /// Binds the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        self.config.validate()?;
        let addr = self.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| EchoError::Config(format!("Failed to bind TCP listener on {addr}: {e}")))
    }

    /// Serves connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.config.validate()?;
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            path = %self.config.upgrade.path,
            max_connections = self.config.limits.max_concurrent_connections,
            "WebSocket echo server listening"
        );

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.dispatch(&mut connections, stream, addr),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(joined) = connections.join_next() => log_join_result(joined),
                () = self.shutdown_signal.cancelled() => {
                    info!("Received shutdown signal, stopping server");
                    self.tracker.close();
                    break;
                }
            }
        }

        drop(listener);
        self.drain(connections).await;

        info!("WebSocket echo server stopped");
        Ok(())
    }

    fn dispatch(&self, connections: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let guard = match self.tracker.try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                match Arc::clone(&self.rejections).try_acquire_owned() {
                    Ok(permit) => {
                        warn!(%addr, error = %e, "Connection rejected");
                        let config = Arc::clone(&self.config);
                        connections.spawn(reject_overloaded(stream, config, permit));
                    }
                    Err(_) => {
                        warn!(
                            %addr,
                            error = %e,
                            "Connection dropped, too many pending rejections"
                        );
                    }
                }
                return;
            }
        };

        let id = guard.id();
        info!(
            %addr,
            id,
            active = self.tracker.metrics().active_connections,
            "Accepted connection"
        );

        let span = tracing::info_span!("connection", %addr, id);
        let handler = ConnectionHandler::new(
            addr,
            Arc::clone(&self.config),
            guard,
            self.shutdown_signal.clone(),
        );
        connections.spawn(
            async move {
                // Outcomes are logged by the handler
                let _ = handler.run(stream).await;
            }
            .instrument(span),
        );
    }

    async fn drain(&self, mut connections: JoinSet<()>) {
        if connections.is_empty() {
            return;
        }

        info!(active = connections.len(), "Waiting for open connections to close");
        let drained = timeout(self.config.shutdown_grace, async {
            while let Some(joined) = connections.join_next().await {
                log_join_result(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Shutdown grace period elapsed, aborting connections"
            );
            connections.shutdown().await;
        }
    }
}

/// Answers a connection over the limit with 503 once its request head is read
///
/// Reading first keeps the kernel from resetting the socket over unread
/// request bytes before the client sees the response. A silent client gets
/// the 503 after a short deadline.
async fn reject_overloaded(
    mut stream: TcpStream,
    config: Arc<WsConfig>,
    _permit: OwnedSemaphorePermit,
) {
    let _ = timeout(
        config.handshake_timeout.min(REJECT_READ_TIMEOUT),
        upgrade::read_request_head(&mut stream, &config.upgrade),
    )
    .await;
    upgrade::reject(&mut stream, &UpgradeError::Overloaded).await;
}

fn log_join_result(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Connection handler panicked");
        }
    }
}

#[async_trait]
impl EchoServerTrait for WsEchoServer {
    /// Binds the configured address and serves until shutdown
    ///
    /// A bind failure is returned immediately; it is the only error that
    /// ends the server.
    async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown_signal.clone()
    }
}
