use crate::websocket::upgrade::UpgradeError;
use thiserror::Error;

/// Error types for the wsecho library
#[derive(Error, Debug)]
pub enum EchoError {
    /// Socket-level errors (bind, accept, connect)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol or transport errors reported by tungstenite
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The HTTP request could not be upgraded to a WebSocket
    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// UTF-8 encoding errors
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Result type for the wsecho library
pub type Result<T> = std::result::Result<T, EchoError>;

pub mod common;
pub mod security;
pub mod websocket;

// Re-export main types for convenience
pub use common::{EchoClient, EchoServerTrait};
pub use security::{ConnectionTracker, ResourceLimits};
pub use websocket::{
    ClientConfig, OriginPolicy, Termination, UpgradePolicy, WsConfig, WsEchoClient, WsEchoServer,
};
