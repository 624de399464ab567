use super::config::WsConfig;
use super::handler::{ConnectionHandler, Termination};
use super::upgrade::UpgradeError;
use crate::security::{ConnectionTracker, ResourceLimits};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, duplex,
};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, client_async};
use tokio_util::sync::CancellationToken;

type HandlerResult = Result<Termination, UpgradeError>;

const HANDSHAKE_REQUEST: &[u8] = b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\n\
    Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

const HANDSHAKE_RESPONSE: &str = "HTTP/1.1 101 Switching Protocols\r\n\
    Upgrade: websocket\r\nConnection: Upgrade\r\n\
    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

struct Harness {
    handle: JoinHandle<HandlerResult>,
    tracker: Arc<ConnectionTracker>,
    shutdown: CancellationToken,
}

fn config_with_idle(idle: Option<Duration>) -> WsConfig {
    WsConfig {
        limits: ResourceLimits {
            max_idle_time: idle,
            ..Default::default()
        },
        handshake_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn spawn_handler<S>(config: WsConfig, io: S) -> Harness
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tracker = Arc::new(ConnectionTracker::new(&config.limits));
    let guard = tracker.try_acquire().unwrap();
    let shutdown = CancellationToken::new();
    let handler = ConnectionHandler::new(
        "127.0.0.1:50000".parse().unwrap(),
        Arc::new(config),
        guard,
        shutdown.clone(),
    );
    let handle = tokio::spawn(handler.run(io));
    Harness {
        handle,
        tracker,
        shutdown,
    }
}

async fn connect(config: WsConfig) -> (WebSocketStream<DuplexStream>, Harness) {
    let (client_io, server_io) = duplex(64 * 1024);
    let harness = spawn_handler(config, server_io);
    let (client, _response) = client_async("ws://localhost/ws", client_io).await.unwrap();
    (client, harness)
}

async fn finish(harness: Harness) -> Termination {
    let result = tokio::time::timeout(Duration::from_secs(5), harness.handle)
        .await
        .expect("handler did not finish")
        .unwrap();
    assert_eq!(harness.tracker.metrics().active_connections, 0);
    result.unwrap()
}

#[tokio::test]
async fn test_echo_preserves_type_and_payload() {
    let (mut client, harness) = connect(config_with_idle(None)).await;

    client.send(Message::text("ping")).await.unwrap();
    assert_eq!(client.next().await.unwrap().unwrap(), Message::text("ping"));

    client
        .send(Message::binary(vec![0x01, 0x02, 0x03]))
        .await
        .unwrap();
    assert_eq!(
        client.next().await.unwrap().unwrap(),
        Message::binary(vec![0x01, 0x02, 0x03])
    );

    client.close(None).await.unwrap();
    // The server answers the close frame and sends nothing else
    assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));

    let termination = finish(harness).await;
    assert!(matches!(termination, Termination::PeerClosed(_)));
    assert!(termination.is_graceful());
}

#[tokio::test]
async fn test_echo_preserves_order() {
    let (mut client, harness) = connect(config_with_idle(None)).await;

    for i in 0..100 {
        client.send(Message::text(format!("message {i}"))).await.unwrap();
    }
    for i in 0..100 {
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::text(format!("message {i}"))
        );
    }

    client.close(None).await.unwrap();
    finish(harness).await;
}

#[tokio::test]
async fn test_ping_is_not_echoed() {
    let (mut client, harness) = connect(config_with_idle(None)).await;

    client.send(Message::Ping(vec![9])).await.unwrap();
    client.send(Message::text("after ping")).await.unwrap();

    assert_eq!(client.next().await.unwrap().unwrap(), Message::Pong(vec![9]));
    assert_eq!(
        client.next().await.unwrap().unwrap(),
        Message::text("after ping")
    );

    client.close(None).await.unwrap();
    finish(harness).await;
}

#[tokio::test]
async fn test_disconnect_without_close_frame() {
    let (client, harness) = connect(config_with_idle(None)).await;
    drop(client);

    assert!(matches!(finish(harness).await, Termination::Disconnected));
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let (mut client, harness) = connect(config_with_idle(Some(Duration::from_millis(100)))).await;

    match client.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert!(matches!(finish(harness).await, Termination::IdleTimeout));
}

#[tokio::test]
async fn test_shutdown_closes_connection() {
    let (mut client, harness) = connect(config_with_idle(None)).await;

    client.send(Message::text("before")).await.unwrap();
    assert_eq!(client.next().await.unwrap().unwrap(), Message::text("before"));

    harness.shutdown.cancel();
    match client.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert!(matches!(finish(harness).await, Termination::Shutdown));
}

#[tokio::test]
async fn test_oversized_message_ends_connection_without_echo() {
    let mut config = config_with_idle(None);
    config.limits.max_message_size = 16;
    let (mut client, harness) = connect(config).await;

    client.send(Message::binary(vec![0u8; 32])).await.unwrap();

    let termination = finish(harness).await;
    assert!(matches!(termination, Termination::ReadFailed(_)));
    assert!(!termination.is_graceful());

    // Nothing was echoed before the stream ended
    while let Some(next) = client.next().await {
        match next {
            Ok(message) => assert!(!message.is_binary(), "unexpected echo"),
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn test_rejected_upgrade_writes_http_error() {
    let (mut client_io, server_io) = duplex(64 * 1024);
    let harness = spawn_handler(config_with_idle(None), server_io);

    client_io
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client_io.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let result = tokio::time::timeout(Duration::from_secs(5), harness.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(UpgradeError::NotWebSocket(_))));
    assert_eq!(harness.tracker.metrics().active_connections, 0);
}

#[tokio::test]
async fn test_silent_client_times_out_handshake() {
    let (_client_io, server_io) = duplex(1024);
    let mut config = config_with_idle(None);
    config.handshake_timeout = Duration::from_millis(100);
    let harness = spawn_handler(config, server_io);

    let result = tokio::time::timeout(Duration::from_secs(5), harness.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(UpgradeError::TimedOut)));
}

#[tokio::test]
async fn test_frame_sent_with_handshake_is_echoed() {
    let (mut client_io, server_io) = duplex(64 * 1024);
    let harness = spawn_handler(config_with_idle(None), server_io);

    let mut request = HANDSHAKE_REQUEST.to_vec();
    // Masked text frame "hi" with mask 01 02 03 04
    request.extend_from_slice(&[0x81, 0x82, 0x01, 0x02, 0x03, 0x04, b'h' ^ 0x01, b'i' ^ 0x02]);
    client_io.write_all(&request).await.unwrap();

    let expected_head = HANDSHAKE_RESPONSE;
    let mut response = vec![0u8; expected_head.len() + 4];
    client_io.read_exact(&mut response).await.unwrap();

    assert_eq!(&response[..expected_head.len()], expected_head.as_bytes());
    // Unmasked text frame "hi" from the server
    assert_eq!(&response[expected_head.len()..], &[0x81, 0x02, b'h', b'i']);

    drop(client_io);
    assert!(matches!(finish(harness).await, Termination::Disconnected));
}

#[tokio::test]
async fn test_echo_write_times_out_when_client_stops_reading() {
    let (client_io, server_io) = duplex(256);
    let mut config = config_with_idle(None);
    config.write_timeout = Duration::from_millis(200);
    let harness = spawn_handler(config, server_io);

    let (mut client, _response) = client_async("ws://localhost/ws", client_io).await.unwrap();
    // Keeps sending and never reads, so the echoes back up
    let writer = tokio::spawn(async move {
        for _ in 0..8 {
            if client.send(Message::binary(vec![7u8; 200])).await.is_err() {
                break;
            }
        }
        client
    });

    let termination = finish(harness).await;
    assert!(matches!(termination, Termination::WriteTimedOut));
    assert!(!termination.is_graceful());
    writer.abort();
}

#[tokio::test]
async fn test_echo_write_fails_when_client_is_gone() {
    let (mut client_io, server_io) = duplex(64 * 1024);
    let harness = spawn_handler(config_with_idle(None), server_io);

    client_io.write_all(HANDSHAKE_REQUEST).await.unwrap();
    let mut response = vec![0u8; HANDSHAKE_RESPONSE.len()];
    client_io.read_exact(&mut response).await.unwrap();
    assert_eq!(response, HANDSHAKE_RESPONSE.as_bytes());

    // Masked text frame "hi", then the client goes away before the echo
    client_io
        .write_all(&[0x81, 0x82, 0x01, 0x02, 0x03, 0x04, b'h' ^ 0x01, b'i' ^ 0x02])
        .await
        .unwrap();
    drop(client_io);

    let termination = finish(harness).await;
    assert!(matches!(termination, Termination::WriteFailed(_)));
    assert!(!termination.is_graceful());
}
