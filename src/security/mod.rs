//! Resource management for the echo server

pub mod limits;

pub use limits::{
    ConnectionError, ConnectionGuard, ConnectionMetrics, ConnectionTracker, ResourceLimits,
};
