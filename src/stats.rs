use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Statistics snapshot for the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStats {
    /// Total number of accepted client connections
    pub total_connections: u64,
    /// Currently live connections (any state)
    pub active_connections: u64,
    /// Connections that reached the bridged state
    pub bridged_connections: u64,
    /// Connections closed because of a protocol mismatch
    pub rejected_connections: u64,
    /// Connections closed because of a handshake, connect, I/O error or timeout
    pub failed_connections: u64,
    /// Total bytes sent to clients
    pub bytes_sent: u64,
    /// Total bytes received from clients
    pub bytes_received: u64,
    /// Timestamp when the proxy started (Unix timestamp)
    pub start_time: u64,
}

/// Statistics tracker shared between the reactor and observers
#[derive(Debug, Clone)]
pub struct ProxyStatsTracker {
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    bridged_connections: Arc<AtomicU64>,
    rejected_connections: Arc<AtomicU64>,
    failed_connections: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    start_time: u64,
}

impl ProxyStatsTracker {
    pub fn new() -> Self {
        Self {
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            bridged_connections: Arc::new(AtomicU64::new(0)),
            rejected_connections: Arc::new(AtomicU64::new(0)),
            failed_connections: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Increment active connections (called on accept)
    pub fn connection_started(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections (called once per teardown)
    pub fn connection_ended(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_bridged(&self) {
        self.bridged_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes sent
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes received
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bridged_connections: self.bridged_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for ProxyStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}
