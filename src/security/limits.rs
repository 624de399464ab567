use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Resource limits for the echo server
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum concurrent connections, upgraded or still handshaking
    pub max_concurrent_connections: usize,
    /// Maximum size of a single WebSocket message in bytes
    pub max_message_size: usize,
    /// Maximum idle time before the server closes a connection (None disables)
    pub max_idle_time: Option<Duration>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 1000,
            max_message_size: 64 << 20, // 64MB, tungstenite's default
            max_idle_time: Some(Duration::from_secs(300)), // 5 minutes
        }
    }
}

/// Connection tracking and management
///
/// Every accepted socket holds a [`ConnectionGuard`] for as long as its
/// handler runs. The guard owns a semaphore permit, so the concurrent
/// connection bound is enforced without any locking on the accept path.
#[derive(Debug)]
pub struct ConnectionTracker {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    connection_semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionTracker {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            active_connections: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            connection_semaphore: Arc::new(Semaphore::new(limits.max_concurrent_connections)),
            max_connections: limits.max_concurrent_connections,
        }
    }

    /// Attempt to take a connection slot without waiting
    pub fn try_acquire(self: &Arc<Self>) -> Result<ConnectionGuard, ConnectionError> {
        let permit = Arc::clone(&self.connection_semaphore)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => ConnectionError::LimitReached {
                    max: self.max_connections,
                },
                TryAcquireError::Closed => ConnectionError::Closed,
            })?;

        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        let id = self.total_connections.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::debug!(
            active_connections = active,
            connection_id = id,
            "Connection acquired"
        );

        Ok(ConnectionGuard {
            _permit: permit,
            tracker: Arc::clone(self),
            id,
            start_time: Instant::now(),
        })
    }

    /// Stop handing out slots; later `try_acquire` calls fail with `Closed`
    pub fn close(&self) {
        self.connection_semaphore.close();
    }

    /// Get current metrics
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            active_connections: self.active_connections.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::SeqCst),
            available_slots: self.connection_semaphore.available_permits(),
            max_connections: self.max_connections,
        }
    }
}

/// RAII guard for one tracked connection
///
/// Dropping the guard, including during a panic unwind, frees the slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    tracker: Arc<ConnectionTracker>,
    id: u64,
    start_time: Instant,
}

impl ConnectionGuard {
    /// Sequence number of this connection since the tracker was created
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the slot was acquired
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self
            .tracker
            .active_connections
            .fetch_sub(1, Ordering::SeqCst)
            - 1;

        tracing::debug!(
            active_connections = active,
            connection_id = self.id,
            connection_duration_ms = self.start_time.elapsed().as_millis(),
            "Connection released"
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection limit of {max} reached")]
    LimitReached { max: usize },
    #[error("Connection tracker closed")]
    Closed,
}

/// Connection metrics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetrics {
    pub active_connections: usize,
    pub total_connections: u64,
    pub available_slots: usize,
    pub max_connections: usize,
}
