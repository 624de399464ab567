use crate::security::ResourceLimits;
use crate::{EchoError, Result};
use http::Request;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Caller-supplied origin check: receives the `Origin` header (if any) and
/// the full upgrade request
pub type OriginPredicate = Arc<dyn Fn(Option<&str>, &Request<()>) -> bool + Send + Sync>;

/// Which browser origins may open a WebSocket
///
/// Requests without an `Origin` header come from non-browser clients and
/// are accepted by every built-in policy.
#[derive(Clone, Default)]
pub enum OriginPolicy {
    /// Accept every origin. Unsafe outside local development.
    AllowAll,
    /// Accept only origins whose host matches the request's `Host` header
    #[default]
    SameOrigin,
    /// Accept only the listed origins, compared exactly (e.g. `https://example.com`)
    AllowList(Vec<String>),
    /// Delegate the decision to a predicate
    Custom(OriginPredicate),
}

impl OriginPolicy {
    /// Wraps a closure as a [`OriginPolicy::Custom`] policy
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(Option<&str>, &Request<()>) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Checks the request's `Origin` header against this policy
    pub fn allows(&self, request: &Request<()>) -> bool {
        if matches!(self, Self::AllowAll) {
            return true;
        }

        let origin = match request.headers().get(http::header::ORIGIN) {
            None => None,
            Some(value) => match value.to_str() {
                Ok(origin) => Some(origin),
                // An origin we cannot read is never trusted
                Err(_) => return false,
            },
        };

        match self {
            Self::AllowAll => true,
            Self::SameOrigin => origin.is_none_or(|origin| same_origin(origin, request)),
            Self::AllowList(allowed) => {
                origin.is_none_or(|origin| allowed.iter().any(|candidate| candidate == origin))
            }
            Self::Custom(predicate) => predicate(origin, request),
        }
    }
}

fn same_origin(origin: &str, request: &Request<()>) -> bool {
    let Ok(uri) = origin.parse::<http::Uri>() else {
        return false;
    };
    let Some(authority) = uri.authority() else {
        return false;
    };
    request
        .headers()
        .get(http::header::HOST)
        .and_then(|host| host.to_str().ok())
        .is_some_and(|host| authority.as_str().eq_ignore_ascii_case(host))
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowAll => f.write_str("AllowAll"),
            Self::SameOrigin => f.write_str("SameOrigin"),
            Self::AllowList(allowed) => f.debug_tuple("AllowList").field(allowed).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Rules for turning an HTTP request into a WebSocket connection
///
/// # Examples
///
/// ```
/// use wsecho::websocket::{OriginPolicy, UpgradePolicy};
///
/// let policy = UpgradePolicy {
///     origin: OriginPolicy::AllowList(vec!["https://example.com".to_string()]),
///     ..Default::default()
/// };
/// assert_eq!(policy.path, "/ws");
/// assert_eq!(policy.read_buffer_size, 1024);
/// ```
#[derive(Debug, Clone)]
pub struct UpgradePolicy {
    /// The only request path that is upgraded
    pub path: String,
    /// Chunk size used when reading the HTTP request head
    pub read_buffer_size: usize,
    /// Bytes tungstenite buffers before flushing frames to the socket
    pub write_buffer_size: usize,
    /// Largest request head accepted before answering 431
    pub max_header_size: usize,
    /// Origin acceptance rule
    pub origin: OriginPolicy,
}

impl Default for UpgradePolicy {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_header_size: 8 * 1024,
            origin: OriginPolicy::default(),
        }
    }
}

/// Configuration for the WebSocket echo server
///
/// # Examples
///
/// ```
/// use wsecho::websocket::WsConfig;
/// use std::time::Duration;
///
/// let config = WsConfig {
///     bind_addr: "127.0.0.1:9001".parse().unwrap(),
///     write_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Upgrade rules (path, buffer sizes, origin policy)
    pub upgrade: UpgradePolicy,
    /// Connection bound, message size cap and idle timeout
    pub limits: ResourceLimits,
    /// Time allowed to read and answer the upgrade request
    pub handshake_timeout: Duration,
    /// Time allowed for a single echo write
    pub write_timeout: Duration,
    /// How long shutdown waits for open connections to close
    pub shutdown_grace: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upgrade: UpgradePolicy::default(),
            limits: ResourceLimits::default(),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl WsConfig {
    /// Rejects settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.upgrade.path.starts_with('/') {
            return Err(EchoError::Config(format!(
                "Upgrade path must start with '/': {:?}",
                self.upgrade.path
            )));
        }
        if self.upgrade.read_buffer_size == 0 || self.upgrade.write_buffer_size == 0 {
            return Err(EchoError::Config(
                "Buffer sizes must be greater than zero".to_string(),
            ));
        }
        if self.upgrade.max_header_size < self.upgrade.read_buffer_size {
            return Err(EchoError::Config(format!(
                "Header limit {} is smaller than the read buffer {}",
                self.upgrade.max_header_size, self.upgrade.read_buffer_size
            )));
        }
        if self.limits.max_concurrent_connections == 0 {
            return Err(EchoError::Config(
                "max_concurrent_connections must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_message_size == 0 {
            return Err(EchoError::Config(
                "max_message_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Frame-level settings handed to tungstenite after the upgrade
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.write_buffer_size = self.upgrade.write_buffer_size;
        config.max_message_size = Some(self.limits.max_message_size);
        config.max_frame_size = Some(
            config
                .max_frame_size
                .map_or(self.limits.max_message_size, |frame| {
                    frame.min(self.limits.max_message_size)
                }),
        );
        config
    }
}
