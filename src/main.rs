use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wsecho::common::EchoServerTrait;
use wsecho::websocket::{OriginPolicy, UpgradePolicy, WsConfig, WsEchoServer};
use wsecho::ResourceLimits;

/// WebSocket echo server
///
/// Upgrades requests on a single path and echoes every message back.
#[derive(Parser, Debug)]
#[command(name = "wsecho")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "WSECHO_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Request path that is upgraded to WebSocket
    #[arg(long, env = "WSECHO_PATH", default_value = "/ws")]
    path: String,

    /// Maximum number of concurrent connections
    #[arg(long, env = "WSECHO_MAX_CONNECTIONS", default_value_t = 1000)]
    max_connections: usize,

    /// Read and write buffer size in bytes
    #[arg(long, env = "WSECHO_BUFFER_SIZE", default_value_t = 1024)]
    buffer_size: usize,

    /// Largest accepted message in bytes
    #[arg(long, env = "WSECHO_MAX_MESSAGE_SIZE", default_value_t = 64 << 20)]
    max_message_size: usize,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long, env = "WSECHO_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Accept connections from any origin (unsafe outside development)
    #[arg(long, env = "WSECHO_ALLOW_ANY_ORIGIN", conflicts_with = "allowed_origin")]
    allow_any_origin: bool,

    /// Origin allowed to connect; may be repeated
    #[arg(long)]
    allowed_origin: Vec<String>,
}

impl Args {
    fn origin_policy(&self) -> OriginPolicy {
        if self.allow_any_origin {
            OriginPolicy::AllowAll
        } else if !self.allowed_origin.is_empty() {
            OriginPolicy::AllowList(self.allowed_origin.clone())
        } else {
            OriginPolicy::SameOrigin
        }
    }

    fn into_config(self) -> WsConfig {
        let origin = self.origin_policy();
        let idle = (self.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.idle_timeout_secs));

        WsConfig {
            bind_addr: self.bind,
            upgrade: UpgradePolicy {
                path: self.path,
                read_buffer_size: self.buffer_size,
                write_buffer_size: self.buffer_size,
                origin,
                ..Default::default()
            },
            limits: ResourceLimits {
                max_concurrent_connections: self.max_connections,
                max_message_size: self.max_message_size,
                max_idle_time: idle,
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wsecho=info")),
        )
        .init();

    let config = Args::parse().into_config();
    config.validate().wrap_err("Invalid configuration")?;

    info!(
        address = %config.bind_addr,
        path = %config.upgrade.path,
        origin = ?config.upgrade.origin,
        "Starting WebSocket echo server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let server = WsEchoServer::new(config);
    let shutdown = server.shutdown_signal();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        shutdown.cancel();
    });

    server
        .run()
        .await
        .wrap_err("Failed to run WebSocket echo server")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let config = Args::parse_from(["wsecho"]).into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.upgrade.path, "/ws");
        assert_eq!(config.upgrade.read_buffer_size, 1024);
        assert_eq!(config.upgrade.write_buffer_size, 1024);
        assert!(matches!(config.upgrade.origin, OriginPolicy::SameOrigin));
        assert_eq!(config.limits.max_idle_time, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_origin_flags() {
        let args = Args::parse_from(["wsecho", "--allow-any-origin"]);
        assert!(matches!(args.origin_policy(), OriginPolicy::AllowAll));

        let args = Args::parse_from([
            "wsecho",
            "--allowed-origin",
            "https://a.example",
            "--allowed-origin",
            "https://b.example",
        ]);
        match args.origin_policy() {
            OriginPolicy::AllowList(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let config = Args::parse_from([
            "wsecho",
            "--idle-timeout-secs",
            "0",
            "--bind",
            "127.0.0.1:9000",
        ])
        .into_config();
        assert_eq!(config.limits.max_idle_time, None);
        assert_eq!(config.bind_addr.port(), 9000);
    }
}
