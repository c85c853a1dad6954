//! Process-wide traffic totals.
//!
//! Every [`Stream`](crate::net::Stream) adds its wire bytes here; UI layers
//! poll [`snapshot`] to render throughput.

use std::sync::atomic::{AtomicU64, Ordering};

static RX_BYTES: AtomicU64 = AtomicU64::new(0);
static TX_BYTES: AtomicU64 = AtomicU64::new(0);

/// Record bytes read from any socket.
pub fn add_rx(bytes: u64) {
    RX_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

/// Record bytes written to any socket.
pub fn add_tx(bytes: u64) {
    TX_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

/// Total bytes read since process start.
pub fn rx_bytes() -> u64 {
    RX_BYTES.load(Ordering::Relaxed)
}

/// Total bytes written since process start.
pub fn tx_bytes() -> u64 {
    TX_BYTES.load(Ordering::Relaxed)
}

/// Point-in-time copy of the global counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Bytes read
    pub rx_bytes: u64,
    /// Bytes written
    pub tx_bytes: u64,
}

/// Read both counters.
pub fn snapshot() -> TrafficSnapshot {
    TrafficSnapshot {
        rx_bytes: rx_bytes(),
        tx_bytes: tx_bytes(),
    }
}
