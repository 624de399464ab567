use super::config::WsConfig;
use super::upgrade::{self, UpgradeError};
use crate::security::ConnectionGuard;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PREVIEW_LEN: usize = 64;

/// Why an echo loop stopped
#[derive(Debug)]
pub enum Termination {
    /// The client sent a close frame
    PeerClosed(Option<CloseFrame<'static>>),
    /// The stream ended without a close frame
    Disconnected,
    /// Reading failed (protocol violation, oversized message, reset)
    ReadFailed(WsError),
    /// Writing the echo failed
    WriteFailed(WsError),
    /// Writing the echo did not finish within the write timeout
    WriteTimedOut,
    /// No message arrived within the idle timeout
    IdleTimeout,
    /// The server is shutting down
    Shutdown,
}

impl Termination {
    /// True when the connection ended without a transport or protocol error
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            Self::PeerClosed(_) | Self::Disconnected | Self::IdleTimeout | Self::Shutdown
        )
    }

    /// Close frame to finish the closing handshake with, if one should be sent
    ///
    /// After a failed read or write nothing more is written.
    fn closing_frame(&self) -> Option<Option<CloseFrame<'static>>> {
        match self {
            Self::PeerClosed(_) => Some(None),
            Self::IdleTimeout => Some(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("idle timeout"),
            })),
            Self::Shutdown => Some(Some(CloseFrame {
                code: CloseCode::Away,
                reason: Cow::Borrowed("server shutting down"),
            })),
            Self::Disconnected
            | Self::ReadFailed(_)
            | Self::WriteFailed(_)
            | Self::WriteTimedOut => None,
        }
    }
}

/// Owns one client connection from upgrade to release
///
/// The connection's tracker slot is held by the handler and freed when
/// `run` returns, unwinds, or is aborted.
pub struct ConnectionHandler {
    addr: SocketAddr,
    config: Arc<WsConfig>,
    guard: ConnectionGuard,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        addr: SocketAddr,
        config: Arc<WsConfig>,
        guard: ConnectionGuard,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            addr,
            config,
            guard,
            shutdown,
        }
    }

    /// Upgrades `stream` and echoes messages until the connection ends
    ///
    /// Upgrade failures are logged and returned; the client has already
    /// received the matching HTTP error response when one applies.
    pub async fn run<S>(self, stream: S) -> Result<Termination, UpgradeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let addr = self.addr;
        let upgraded = timeout(
            self.config.handshake_timeout,
            upgrade::accept(stream, &self.config),
        )
        .await
        .unwrap_or(Err(UpgradeError::TimedOut));

        let (mut ws, request) = match upgraded {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(
                    %addr,
                    error = %e,
                    status = ?e.status().map(|s| s.as_u16()),
                    "Upgrade failed"
                );
                return Err(e);
            }
        };

        info!(
            %addr,
            path = %request.uri(),
            origin = ?request.headers().get(http::header::ORIGIN),
            "Client connected"
        );

        let termination = echo_loop(&mut ws, &self.config, &self.shutdown).await;
        log_termination(addr, &termination);

        if let Some(frame) = termination.closing_frame() {
            match timeout(self.config.write_timeout, ws.close(frame)).await {
                Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) => {}
                Ok(Err(e)) => debug!(%addr, error = %e, "Close handshake failed"),
                Err(_) => debug!(%addr, "Close handshake timed out"),
            }
        }
        drop(ws);

        info!(
            %addr,
            duration_ms = self.guard.elapsed().as_millis(),
            "Connection closed"
        );
        Ok(termination)
    }
}

/// Echoes every text and binary message back with the same type until the
/// connection ends
///
/// Messages are handled strictly one at a time, so echoes leave in the
/// order they arrived. Control frames are answered by tungstenite and never
/// echoed.
pub async fn echo_loop<S>(
    ws: &mut WebSocketStream<S>,
    config: &WsConfig,
    shutdown: &CancellationToken,
) -> Termination
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            next = next_message(ws, config) => next,
            () = shutdown.cancelled() => return Termination::Shutdown,
        };

        let message = match next {
            Err(termination) => return termination,
            Ok(Message::Close(frame)) => {
                return Termination::PeerClosed(frame.map(CloseFrame::into_owned));
            }
            Ok(message) if message.is_text() || message.is_binary() => message,
            // Ping, pong and raw frames
            Ok(_) => continue,
        };

        let size = message.len();
        debug!(
            size,
            kind = if message.is_text() { "text" } else { "binary" },
            preview = %preview(&message),
            "Received message"
        );

        match timeout(config.write_timeout, ws.send(message)).await {
            Ok(Ok(())) => debug!(size, "Echoed message"),
            Ok(Err(e)) => return Termination::WriteFailed(e),
            Err(_) => return Termination::WriteTimedOut,
        }
    }
}

async fn next_message<S>(
    ws: &mut WebSocketStream<S>,
    config: &WsConfig,
) -> Result<Message, Termination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let next = match config.limits.max_idle_time {
        Some(idle) => timeout(idle, ws.next())
            .await
            .map_err(|_| Termination::IdleTimeout)?,
        None => ws.next().await,
    };

    match next {
        Some(Ok(message)) => Ok(message),
        None
        | Some(Err(
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
        )) => Err(Termination::Disconnected),
        Some(Err(e)) => Err(Termination::ReadFailed(e)),
    }
}

fn preview(message: &Message) -> Cow<'_, str> {
    let data: &[u8] = match message {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => &data[..],
        _ => &[],
    };
    String::from_utf8_lossy(&data[..data.len().min(PREVIEW_LEN)])
}

fn log_termination(addr: SocketAddr, termination: &Termination) {
    match termination {
        Termination::PeerClosed(frame) => info!(
            %addr,
            code = ?frame.as_ref().map(|f| u16::from(f.code)),
            "Client closed connection"
        ),
        Termination::Disconnected => info!(%addr, "Client disconnected"),
        Termination::ReadFailed(e) => {
            warn!(%addr, error = %e, "Client disconnected with read error")
        }
        Termination::WriteFailed(e) => error!(%addr, error = %e, "Failed to echo message"),
        Termination::WriteTimedOut => error!(%addr, "Echo write timed out"),
        Termination::IdleTimeout => info!(%addr, "Closing idle connection"),
        Termination::Shutdown => info!(%addr, "Closing connection for shutdown"),
    }
}
