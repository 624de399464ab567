//! WebSocket echo server implementation
//!
//! This module upgrades HTTP requests on a single path to WebSocket
//! connections and echoes every text and binary message back to its
//! sender, preserving the message type.

pub mod client;
pub mod config;
pub mod handler;
pub mod server;
pub mod upgrade;

#[cfg(test)]
mod tests;

pub use client::{ClientConfig, ClientConfigBuilder, WsEchoClient};
pub use config::{OriginPolicy, UpgradePolicy, WsConfig};
pub use handler::{ConnectionHandler, Termination, echo_loop};
pub use server::WsEchoServer;
pub use upgrade::UpgradeError;
