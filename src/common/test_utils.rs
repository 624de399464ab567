use crate::websocket::{WsConfig, WsEchoServer};
use crate::{EchoError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Handle to a WebSocket echo server running on a loopback port
pub struct TestServer {
    /// Address the server accepted connections on
    pub addr: SocketAddr,
    /// The server itself, for metrics and shutdown
    pub server: Arc<WsEchoServer>,
    /// The task driving `serve`
    pub handle: JoinHandle<Result<()>>,
}

impl TestServer {
    /// URL of the echo endpoint
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.server.config().upgrade.path)
    }

    /// Signals shutdown and waits for the server task to finish
    pub async fn shutdown(self) -> Result<()> {
        self.server.shutdown();
        self.handle
            .await
            .map_err(|e| EchoError::Config(format!("Server task failed: {e}")))?
    }
}

/// Starts a WebSocket echo server on `127.0.0.1:0` for tests and benches
///
/// The listener is bound before the server task starts, so the returned
/// address is accepting connections as soon as this function returns.
/// `config.bind_addr` is ignored.
pub async fn spawn_test_server(config: WsConfig) -> Result<TestServer> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| EchoError::Config(format!("Failed to bind listener: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| EchoError::Config(format!("Failed to get local address: {e}")))?;

    let server = Arc::new(WsEchoServer::new(WsConfig {
        bind_addr: addr,
        ..config
    }));
    let handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    Ok(TestServer {
        addr,
        server,
        handle,
    })
}
