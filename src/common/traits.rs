use crate::{EchoError, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Common trait for echo servers
///
/// Defines the lifecycle interface the binary and the tests drive a
/// server through.
#[async_trait]
pub trait EchoServerTrait {
    /// Binds the configured address and serves connections until shutdown
    async fn run(&self) -> Result<()>;

    /// Returns a token that gracefully shuts the server down when cancelled
    fn shutdown_signal(&self) -> CancellationToken;
}

/// Common trait for echo clients
///
/// `echo` round-trips raw bytes; `echo_string` round-trips UTF-8 text.
/// Implementations are free to carry text with a different message
/// type than bytes.
#[async_trait]
pub trait EchoClient {
    /// Sends data to the echo server and returns the echoed response
    async fn echo(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Sends a string and returns the echoed string
    async fn echo_string(&mut self, data: &str) -> Result<String> {
        let response = self.echo(data.as_bytes()).await?;
        String::from_utf8(response).map_err(EchoError::Utf8)
    }
}
