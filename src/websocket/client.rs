use crate::common::EchoClient;
use crate::{EchoError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, client_async_with_config};

/// Configuration for WebSocket echo clients
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Request path of the echo endpoint
    pub path: String,
    /// `Origin` header to send, if any
    pub origin: Option<String>,
    /// Read timeout for operations
    pub read_timeout: Duration,
    /// Write timeout for operations
    pub write_timeout: Duration,
    /// Connection and handshake timeout
    pub connect_timeout: Duration,
    /// Maximum message size accepted from the server
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            origin: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_message_size: 64 << 20, // 64MB
        }
    }
}

/// WebSocket echo client
///
/// # Examples
///
/// ```no_run
/// use wsecho::common::EchoClient;
/// use wsecho::websocket::WsEchoClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let addr = "127.0.0.1:8080".parse()?;
///     let mut client = WsEchoClient::connect(addr).await?;
///
///     let response = client.echo_string("Hello, WebSocket Server!").await?;
///     println!("Server echoed: {}", response);
///
///     let data = client.echo(&[0x01, 0x02, 0x03]).await?;
///     println!("Server echoed {} bytes", data.len());
///
///     client.close().await?;
///     Ok(())
/// }
/// ```
pub struct WsEchoClient {
    stream: WebSocketStream<TcpStream>,
    config: ClientConfig,
}

impl WsEchoClient {
    /// Connect to a server with custom configuration
    pub async fn connect_with_config(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        let tcp = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| EchoError::Timeout("Connection timeout".to_string()))??;
        tcp.set_nodelay(true)?;

        let mut request = format!("ws://{addr}{}", config.path).into_client_request()?;
        if let Some(origin) = &config.origin {
            let origin = HeaderValue::from_str(origin)
                .map_err(|e| EchoError::Config(format!("Invalid origin {origin:?}: {e}")))?;
            request.headers_mut().insert(http::header::ORIGIN, origin);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);

        let (stream, _response) = timeout(
            config.connect_timeout,
            client_async_with_config(request, tcp, Some(ws_config)),
        )
        .await
        .map_err(|_| EchoError::Timeout("Handshake timeout".to_string()))??;

        Ok(Self { stream, config })
    }

    /// Connect with default configuration
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    /// Sends one message
    pub async fn send(&mut self, message: Message) -> Result<()> {
        timeout(self.config.write_timeout, self.stream.send(message))
            .await
            .map_err(|_| EchoError::Timeout("Write timeout".to_string()))??;
        Ok(())
    }

    /// Receives the next data or close message
    ///
    /// Pings and pongs are skipped. `None` means the server ended the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            let next = timeout(self.config.read_timeout, self.stream.next())
                .await
                .map_err(|_| EchoError::Timeout("Read timeout".to_string()))?;

            match next {
                None => return Ok(None),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(message)) => return Ok(Some(message)),
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Sends `message` and waits for the next message back
    pub async fn round_trip(&mut self, message: Message) -> Result<Message> {
        self.send(message).await?;
        match self.recv().await? {
            Some(Message::Close(frame)) => Err(EchoError::WebSocket(WsError::Io(
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    format!("Server closed the connection: {frame:?}"),
                ),
            ))),
            Some(message) => Ok(message),
            None => Err(EchoError::WebSocket(WsError::ConnectionClosed)),
        }
    }

    /// Performs the closing handshake and waits for the server to finish it
    pub async fn close(mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) => {}
            Err(e) => return Err(e.into()),
        }
        while let Some(_message) = self.recv().await? {}
        Ok(())
    }

    /// Get client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl EchoClient for WsEchoClient {
    /// Echoes `data` as a binary message
    async fn echo(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.round_trip(Message::binary(data.to_vec())).await? {
            Message::Binary(echoed) => Ok(echoed),
            other => Err(EchoError::Config(format!(
                "Expected a binary echo, got {other:?}"
            ))),
        }
    }

    /// Echoes `data` as a text message
    async fn echo_string(&mut self, data: &str) -> Result<String> {
        match self.round_trip(Message::text(data)).await? {
            Message::Text(echoed) => Ok(echoed),
            other => Err(EchoError::Config(format!(
                "Expected a text echo, got {other:?}"
            ))),
        }
    }
}

/// Builder for client configuration
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origin = Some(origin.into());
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
