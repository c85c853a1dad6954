//! Accepted connections and the table that owns them.
//!
//! The acceptor's table holds the canonical `Arc<Connection>` for each live
//! connection; the protocol task holds another handle and uses it to report
//! state and to observe close requests. Entries leave the table only when
//! their task finishes.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::net::{AlpnProtocol, StreamCounters};

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, TLS handshake not finished
    Accepted,
    /// SOCKS5 method negotiation
    MethodSelect,
    /// Reading the request and opening the upstream leg
    Handshake,
    /// Relaying in both directions
    Stream,
    /// Failed; waiting for teardown
    Error,
    /// Torn down
    Closed,
}

impl ConnectionState {
    /// Whether the connection failed before reaching the relay.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnectionState::Accepted | ConnectionState::MethodSelect | ConnectionState::Handshake
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::MethodSelect => "method_select",
            ConnectionState::Handshake => "handshake",
            ConnectionState::Stream => "stream",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One accepted client connection.
pub struct Connection {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    created_at: Instant,
    state: Mutex<ConnectionState>,
    alpn: Mutex<Option<AlpnProtocol>>,
    counters: Mutex<Option<Arc<StreamCounters>>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection with a fresh id.
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            peer_addr,
            created_at: Instant::now(),
            state: Mutex::new(ConnectionState::Accepted),
            alpn: Mutex::new(None),
            counters: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `state`. `Closed` is terminal.
    pub fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Closed {
            tracing::trace!(id = self.id, from = %*current, to = %state, "state");
            *current = state;
        }
    }

    /// Protocol identity negotiated on the downstream leg.
    pub fn alpn(&self) -> Option<AlpnProtocol> {
        *self.alpn.lock()
    }

    pub(crate) fn set_alpn(&self, alpn: Option<AlpnProtocol>) {
        *self.alpn.lock() = alpn;
    }

    pub(crate) fn attach_counters(&self, counters: Arc<StreamCounters>) {
        *self.counters.lock() = Some(counters);
    }

    /// Wire bytes read from the client so far.
    pub fn bytes_read(&self) -> u64 {
        self.counters.lock().as_ref().map_or(0, |c| c.bytes_read())
    }

    /// Wire bytes written to the client so far.
    pub fn bytes_written(&self) -> u64 {
        self.counters.lock().as_ref().map_or(0, |c| c.bytes_written())
    }

    /// Time since accept.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Request teardown. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.close_tx.send_replace(true);
        }
        first
    }

    /// Whether teardown has been requested.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        // The sender lives in `self`, so this only ends on `true`.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Point-in-time view for status displays.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            peer_addr: self.peer_addr,
            state: self.state(),
            alpn: self.alpn(),
            age: self.age(),
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Connection statistics (no payload data).
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Connection id
    pub id: ConnectionId,
    /// Remote address of the accepted socket
    pub peer_addr: SocketAddr,
    /// Lifecycle stage at snapshot time
    pub state: ConnectionState,
    /// Negotiated ALPN protocol, if TLS was used
    pub alpn: Option<AlpnProtocol>,
    /// Time since accept
    pub age: Duration,
    /// Bytes read from the peer
    pub bytes_read: u64,
    /// Bytes written to the peer
    pub bytes_written: u64,
}

/// Live connections of one acceptor.
pub struct ConnectionTable {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    count_tx: watch::Sender<usize>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            connections: RwLock::new(HashMap::new()),
            count_tx,
        }
    }

    /// Register a connection.
    pub fn insert(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.write();
        connections.insert(conn.id(), conn);
        self.count_tx.send_replace(connections.len());
    }

    /// Remove a connection; returns it if it was present.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write();
        let removed = connections.remove(&id);
        self.count_tx.send_replace(connections.len());
        removed
    }

    /// Look up a connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Request teardown of every live connection; returns how many were asked.
    pub fn close_all(&self) -> usize {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        connections.iter().filter(|c| c.close()).count()
    }

    /// Resolves once the table is empty.
    pub async fn wait_empty(&self) {
        let mut rx = self.count_tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Statistics for all live connections.
    pub fn all_stats(&self) -> Vec<ConnectionStats> {
        self.connections
            .read()
            .values()
            .map(|c| c.stats())
            .collect()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Arc<Connection> {
        Arc::new(Connection::new(
            "127.0.0.1:1080".parse().unwrap(),
            "127.0.0.1:54321".parse().unwrap(),
        ))
    }

    #[test]
    fn test_ids_are_unique() {
        let a = conn();
        let b = conn();
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_state_transitions() {
        let c = conn();
        assert_eq!(c.state(), ConnectionState::Accepted);
        assert!(c.state().is_handshaking());

        c.set_state(ConnectionState::MethodSelect);
        c.set_state(ConnectionState::Handshake);
        c.set_state(ConnectionState::Stream);
        assert!(!c.state().is_handshaking());

        c.set_state(ConnectionState::Closed);
        c.set_state(ConnectionState::Stream);
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let c = conn();
        assert!(!c.is_closed());
        assert!(c.close());
        assert!(!c.close());
        assert!(c.is_closed());
        // Resolves immediately once closed.
        c.closed().await;
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let c = conn();
        let waiter = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.closed().await })
        };
        tokio::task::yield_now().await;
        c.close();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_table_insert_remove_and_wait() {
        let table = Arc::new(ConnectionTable::new());
        let a = conn();
        let b = conn();
        table.insert(Arc::clone(&a));
        table.insert(Arc::clone(&b));
        assert_eq!(table.count(), 2);
        assert!(table.get(a.id()).is_some());

        assert_eq!(table.close_all(), 2);
        assert_eq!(table.close_all(), 0);
        assert!(a.is_closed() && b.is_closed());

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait_empty().await })
        };
        assert!(table.remove(a.id()).is_some());
        assert!(table.remove(a.id()).is_none());
        table.remove(b.id());
        waiter.await.unwrap();
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_stats_without_counters() {
        let c = conn();
        c.set_alpn(Some(AlpnProtocol::Fallback));
        let stats = c.stats();
        assert_eq!(stats.bytes_read, 0);
        assert_eq!(stats.alpn, Some(AlpnProtocol::Fallback));
        assert_eq!(stats.state, ConnectionState::Accepted);
        assert_eq!(stats.peer_addr, c.peer_addr());
        assert_eq!(stats.id, c.id());
    }
}
