//! Acceptor metrics.
//!
//! Aggregate counters only; nothing here identifies a peer or a target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::net::AlpnProtocol;

/// Acceptor metrics collector.
pub struct ServerMetrics {
    /// Creation time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Connections that negotiated `h2`
    native_connections: AtomicU64,
    /// Connections that negotiated `http/1.1`
    fallback_connections: AtomicU64,
    /// Connections that failed before reaching the relay
    handshake_errors: AtomicU64,
    /// Connections that failed while relaying
    stream_errors: AtomicU64,
    /// Wire bytes written to clients
    bytes_sent: AtomicU64,
    /// Wire bytes read from clients
    bytes_received: AtomicU64,
    /// Listening sockets currently open
    listens: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            native_connections: AtomicU64::new(0),
            fallback_connections: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            stream_errors: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            listens: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a negotiated ALPN identity.
    pub fn record_alpn(&self, alpn: AlpnProtocol) {
        match alpn {
            AlpnProtocol::Native => self.native_connections.fetch_add(1, Ordering::Relaxed),
            AlpnProtocol::Fallback => self.fallback_connections.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Increment handshake error count.
    pub fn increment_handshake_errors(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment relay error count.
    pub fn increment_stream_errors(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A listening socket opened.
    pub fn increment_listens(&self) {
        self.listens.fetch_add(1, Ordering::Relaxed);
    }

    /// A listening socket closed.
    pub fn decrement_listens(&self) {
        self.listens.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get handshake errors.
    pub fn handshake_errors(&self) -> u64 {
        self.handshake_errors.load(Ordering::Relaxed)
    }

    /// Get total bytes sent.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get total bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Get open listening sockets.
    pub fn listens(&self) -> u64 {
        self.listens.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            native_connections: self.native_connections.load(Ordering::Relaxed),
            fallback_connections: self.fallback_connections.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors(),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            listens: self.listens(),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Proxy Metrics
=============
Uptime: {} seconds
Listening sockets: {}

Connections:
  Total:    {}
  Active:   {}
  h2:       {}
  http/1.1: {}

Traffic:
  Sent:     {} bytes
  Received: {} bytes

Errors:
  Handshake: {}
  Stream:    {}
"#,
            snapshot.uptime_secs,
            snapshot.listens,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.native_connections,
            snapshot.fallback_connections,
            snapshot.bytes_sent,
            snapshot.bytes_received,
            snapshot.handshake_errors,
            snapshot.stream_errors,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since the acceptor was created
    pub uptime_secs: u64,
    /// Connections accepted in total
    pub total_connections: u64,
    /// Connections currently open
    pub active_connections: u64,
    /// TLS connections that negotiated `h2`
    pub native_connections: u64,
    /// TLS connections that negotiated `http/1.1`
    pub fallback_connections: u64,
    /// Connections that failed before streaming
    pub handshake_errors: u64,
    /// Connections that failed while streaming
    pub stream_errors: u64,
    /// Bytes written to peers
    pub bytes_sent: u64,
    /// Bytes read from peers
    pub bytes_received: u64,
    /// Listening sockets currently open
    pub listens: u64,
}

impl MetricsSnapshot {
    /// Fraction of connections that failed before relaying.
    pub fn handshake_error_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.handshake_errors as f64 / self.total_connections as f64
        }
    }

    /// Calculate connections per second.
    pub fn connections_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.total_connections as f64 / self.uptime_secs as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 / self.uptime_secs as f64
        }
    }
}
