//! HTTP-to-WebSocket upgrade
//!
//! Reads the request head off a fresh connection, checks it against the
//! [`UpgradePolicy`], and either answers `101 Switching Protocols` and hands
//! the socket to tungstenite, or writes a plain HTTP error response.

use super::config::{UpgradePolicy, WsConfig};
use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderName};
use http::{Method, Request, StatusCode, Version};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::debug;

const MAX_HEADERS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Connection closed before the request head was complete")]
    Incomplete,
    #[error("Handshake timed out")]
    TimedOut,
    #[error("HTTP parsing error: {0}")]
    HttpParse(String),
    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("No handler for path {0}")]
    NotFound(String),
    #[error("Method {0} not allowed, expected GET")]
    MethodNotAllowed(String),
    #[error("Client is not using the websocket protocol: {0}")]
    NotWebSocket(&'static str),
    #[error("Unsupported Sec-WebSocket-Version, expected 13")]
    UnsupportedVersion,
    #[error("Origin not allowed: {0}")]
    OriginRejected(String),
    #[error("Missing or invalid Sec-WebSocket-Key header")]
    InvalidKey,
    #[error("Server is at its connection limit")]
    Overloaded,
}

impl UpgradeError {
    /// HTTP status sent back for this failure, `None` when the socket is unusable
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Io(_) | Self::Incomplete | Self::TimedOut => None,
            Self::HttpParse(_)
            | Self::NotWebSocket(_)
            | Self::UnsupportedVersion
            | Self::InvalidKey => Some(StatusCode::BAD_REQUEST),
            Self::HeadTooLarge(_) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Self::NotFound(_) => Some(StatusCode::NOT_FOUND),
            Self::MethodNotAllowed(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            Self::OriginRejected(_) => Some(StatusCode::FORBIDDEN),
            Self::Overloaded => Some(StatusCode::SERVICE_UNAVAILABLE),
        }
    }
}

/// Upgrades `stream` to a WebSocket or answers with an HTTP error
///
/// On success the parsed request is returned next to the live stream. Bytes
/// the client sent after the request head are passed on to tungstenite.
pub async fn accept<S>(
    mut stream: S,
    config: &WsConfig,
) -> Result<(WebSocketStream<S>, Request<()>), UpgradeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let negotiated = async {
        let (request, leftover) = read_request_head(&mut stream, &config.upgrade).await?;
        let accept_key = validate(&request, &config.upgrade)?;
        Ok::<_, UpgradeError>((request, leftover, accept_key))
    }
    .await;

    let (request, leftover, accept_key) = match negotiated {
        Ok(negotiated) => negotiated,
        Err(e) => {
            reject(&mut stream, &e).await;
            return Err(e);
        }
    };

    stream
        .write_all(switching_protocols_response(&accept_key).as_bytes())
        .await?;
    stream.flush().await?;

    let ws = WebSocketStream::from_partially_read(
        stream,
        leftover.to_vec(),
        Role::Server,
        Some(config.websocket_config()),
    )
    .await;

    Ok((ws, request))
}

/// Writes the HTTP error response for `err`, if it has one, and closes the write side
pub async fn reject<S>(stream: &mut S, err: &UpgradeError)
where
    S: AsyncWrite + Unpin,
{
    let Some(response) = error_response(err) else {
        return;
    };
    let written = async {
        stream.write_all(&response).await?;
        stream.flush().await?;
        stream.shutdown().await
    }
    .await;
    if let Err(e) = written {
        debug!(error = %e, "Failed to write upgrade rejection");
    }
}

/// Reads until a complete HTTP request head is buffered
///
/// Returns the parsed request and whatever followed the head.
pub async fn read_request_head<S>(
    stream: &mut S,
    policy: &UpgradePolicy,
) -> Result<(Request<()>, BytesMut), UpgradeError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(policy.read_buffer_size);

    loop {
        if let Some((head_len, request)) = parse_request_head(&buffer)? {
            if head_len > policy.max_header_size {
                return Err(UpgradeError::HeadTooLarge(policy.max_header_size));
            }
            let leftover = buffer.split_off(head_len);
            return Ok((request, leftover));
        }

        if buffer.len() >= policy.max_header_size {
            return Err(UpgradeError::HeadTooLarge(policy.max_header_size));
        }

        buffer.reserve(policy.read_buffer_size);
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            return Err(UpgradeError::Incomplete);
        }
    }
}

/// Parses an HTTP/1.x request head; `Ok(None)` means more bytes are needed
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(usize, Request<()>)>, UpgradeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => head_len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(UpgradeError::HttpParse(format!(
                "Failed to parse headers: {e}"
            )));
        }
    };

    let method = req
        .method
        .ok_or_else(|| UpgradeError::HttpParse("Missing method".to_string()))?;
    let path = req
        .path
        .ok_or_else(|| UpgradeError::HttpParse("Missing request target".to_string()))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder().method(method).uri(path).version(version);
    for h in req.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    let request = builder
        .body(())
        .map_err(|e| UpgradeError::HttpParse(e.to_string()))?;

    Ok(Some((head_len, request)))
}

/// Checks a parsed request against the upgrade rules
///
/// Returns the `Sec-WebSocket-Accept` value on success.
pub fn validate(request: &Request<()>, policy: &UpgradePolicy) -> Result<String, UpgradeError> {
    let headers = request.headers();

    if request.uri().path() != policy.path {
        return Err(UpgradeError::NotFound(request.uri().path().to_string()));
    }
    if !has_token(headers, &header::CONNECTION, "upgrade") {
        return Err(UpgradeError::NotWebSocket(
            "'upgrade' token not found in 'Connection' header",
        ));
    }
    if !has_token(headers, &header::UPGRADE, "websocket") {
        return Err(UpgradeError::NotWebSocket(
            "'websocket' token not found in 'Upgrade' header",
        ));
    }
    if *request.method() != Method::GET {
        return Err(UpgradeError::MethodNotAllowed(request.method().to_string()));
    }
    if !has_token(headers, &header::SEC_WEBSOCKET_VERSION, "13") {
        return Err(UpgradeError::UnsupportedVersion);
    }
    if !policy.origin.allows(request) {
        let origin = headers
            .get(header::ORIGIN)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_default();
        return Err(UpgradeError::OriginRejected(origin));
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(UpgradeError::InvalidKey)?;
    if !is_valid_challenge_key(key.as_bytes()) {
        return Err(UpgradeError::InvalidKey);
    }

    Ok(derive_accept_key(key.as_bytes()))
}

/// Comma-separated header token match, case-insensitive, across repeated headers
fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// A valid key is the base64 encoding of 16 bytes: 22 symbols and `==`
fn is_valid_challenge_key(key: &[u8]) -> bool {
    key.len() == 24
        && key.ends_with(b"==")
        && key[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

pub fn switching_protocols_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
}

/// Plain-text HTTP response for a failed upgrade
pub fn error_response(err: &UpgradeError) -> Option<Vec<u8>> {
    let status = err.status()?;
    let body = status.canonical_reason().unwrap_or("Error");

    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n",
        status.as_u16(),
        body,
        body.len()
    );
    match err {
        UpgradeError::UnsupportedVersion => response.push_str("Sec-WebSocket-Version: 13\r\n"),
        UpgradeError::MethodNotAllowed(_) => response.push_str("Allow: GET\r\n"),
        _ => {}
    }
    response.push_str("\r\n");
    response.push_str(body);

    Some(response.into_bytes())
}
