//! Common traits and helpers used across the wsecho library
//!
//! This module contains the core traits that define the interface
//! for echo servers and clients.

pub mod test_utils;
pub mod traits;

pub use test_utils::spawn_test_server;
pub use traits::{EchoClient, EchoServerTrait};
