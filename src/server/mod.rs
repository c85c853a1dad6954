//! Acceptor ("ContentServer").
//!
//! Owns a bounded table of listening sockets and the table of live
//! connections accepted on them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ContentServer                         │
//! │  ┌──────────────┐  ┌──────────────┐     ┌──────────────┐     │
//! │  │ accept loop  │  │ accept loop  │ ... │ (max_listens)│     │
//! │  └──────┬───────┘  └──────┬───────┘     └──────────────┘     │
//! │         │ socket policy, spawn, next accept                  │
//! │         ▼                                                    │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ connection task: TLS accept + ALPN → factory.serve()   │  │
//! │  │ raced against Connection::closed()                     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │         │ on exit: remove from table, update metrics         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! An accept loop never waits for a connection: each one runs in its own
//! task. [`ContentServer::stop`] may be called from any task or thread.

mod connection;
mod metrics;

pub use connection::{
    Connection, ConnectionId, ConnectionState, ConnectionStats, ConnectionTable,
};
pub use metrics::{MetricsSnapshot, ServerMetrics};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::net::{SocketPolicy, Stream, TlsServer};

/// Builds the protocol side of each accepted connection.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Short protocol name for logs.
    fn name(&self) -> &'static str;

    /// Drive one connection to completion.
    ///
    /// The future is dropped if the connection is closed from outside,
    /// which closes both of its streams.
    async fn serve(&self, conn: Arc<Connection>, downstream: Stream) -> Result<()>;
}

/// Acceptor settings.
#[derive(Debug, Clone)]
pub struct ContentServerOptions {
    /// Maximum number of concurrently open listening sockets
    pub max_listens: usize,
    /// Bound on the TLS server handshake
    pub handshake_timeout: Duration,
    /// Policy applied to every accepted socket
    pub socket_policy: SocketPolicy,
    /// TLS identity; `None` accepts plain TCP
    pub tls: Option<TlsServer>,
}

impl Default for ContentServerOptions {
    fn default() -> Self {
        Self {
            max_listens: 16,
            handshake_timeout: Duration::from_millis(crate::DEFAULT_CONNECT_TIMEOUT_MS),
            socket_policy: SocketPolicy::default(),
            tls: None,
        }
    }
}

struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    options: ContentServerOptions,
    listens: Mutex<HashMap<SocketAddr, JoinHandle<()>>>,
    connections: ConnectionTable,
    metrics: Arc<ServerMetrics>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Listener set plus connection table.
#[derive(Clone)]
pub struct ContentServer {
    inner: Arc<Inner>,
}

impl ContentServer {
    /// Create an acceptor that hands every connection to `factory`.
    pub fn new(factory: Arc<dyn ConnectionFactory>, options: ContentServerOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                factory,
                options,
                listens: Mutex::new(HashMap::new()),
                connections: ConnectionTable::new(),
                metrics: Arc::new(ServerMetrics::new()),
                stopped: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Bind `addr`, start accepting, and return the bound address.
    ///
    /// Distinct addresses may be added one at a time up to `max_listens`.
    pub async fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.inner.listens.lock().len() >= self.inner.options.max_listens {
            return Err(Error::config(format!(
                "listen table full ({} sockets)",
                self.inner.options.max_listens
            )));
        }

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(backlog)?;
        let bound = listener.local_addr()?;

        let mut listens = self.inner.listens.lock();
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if listens.len() >= self.inner.options.max_listens {
            return Err(Error::config(format!(
                "listen table full ({} sockets)",
                self.inner.options.max_listens
            )));
        }
        let handle = tokio::spawn(Arc::clone(&self.inner).accept_loop(listener, bound));
        listens.insert(bound, handle);
        self.inner.metrics.increment_listens();

        tracing::info!(
            "{} listening on {}{}",
            self.inner.factory.name(),
            bound,
            if self.inner.options.tls.is_some() { " (TLS)" } else { "" }
        );
        Ok(bound)
    }

    /// Addresses currently being accepted on.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listens.lock().keys().copied().collect()
    }

    /// Number of live connections.
    pub fn current_connections(&self) -> usize {
        self.inner.connections.count()
    }

    /// Statistics for every live connection.
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        self.inner.connections.all_stats()
    }

    /// Acceptor metrics.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Close every listener and every live connection, then wait for the
    /// connection tasks to finish. Later calls return immediately.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);

        let handles: Vec<_> = self.inner.listens.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let closing = self.inner.connections.close_all();
        tracing::info!(
            "{} stopped, closing {} connection(s)",
            self.inner.factory.name(),
            closing
        );
        self.inner.connections.wait_empty().await;
    }
}

impl Inner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, addr: SocketAddr) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            // The watch::Ref from wait_for must not outlive the select.
            let accepted = tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((tcp, peer)) => Arc::clone(&self).spawn_connection(tcp, peer),
                Err(e) => {
                    tracing::warn!("Accept error on {}: {}", addr, e);
                    // Typically EMFILE; back off instead of spinning.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        self.metrics.decrement_listens();
        tracing::debug!("listener {} closed", addr);
    }

    fn spawn_connection(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr) {
        let local = match tcp.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Dropping connection from {}: {}", peer, e);
                return;
            }
        };
        self.options.socket_policy.apply(&tcp);

        let conn = Arc::new(Connection::new(local, peer));
        self.connections.insert(Arc::clone(&conn));
        self.metrics.increment_connections();
        // Pairs with the flag swap in `stop`: either stop sees this entry or we see the flag.
        if self.stopped.load(Ordering::SeqCst) {
            conn.close();
        }

        tracing::debug!(id = conn.id(), %peer, "connection accepted");
        tokio::spawn(async move {
            let result = tokio::select! {
                r = self.run_connection(Arc::clone(&conn), tcp) => r,
                _ = conn.closed() => Err(Error::Closed),
            };
            self.disconnect(&conn, result);
        });
    }

    async fn run_connection(&self, conn: Arc<Connection>, tcp: TcpStream) -> Result<()> {
        let stream = Stream::accept(
            tcp,
            self.options.tls.as_ref(),
            self.options.handshake_timeout,
        )
        .await?;

        conn.attach_counters(stream.counters());
        conn.set_alpn(stream.alpn());
        if let Some(alpn) = stream.alpn() {
            self.metrics.record_alpn(alpn);
            tracing::debug!(id = conn.id(), %alpn, "ALPN negotiated");
        }
        conn.set_state(ConnectionState::Handshake);

        self.factory.serve(conn, stream).await
    }

    /// Runs exactly once per connection, from its own task.
    fn disconnect(&self, conn: &Connection, result: Result<()>) {
        let stage = conn.state();
        match &result {
            Ok(()) => tracing::debug!(id = conn.id(), "connection finished"),
            Err(Error::Closed) => tracing::debug!(id = conn.id(), %stage, "connection closed"),
            Err(e) => {
                if stage.is_handshaking() {
                    self.metrics.increment_handshake_errors();
                } else {
                    self.metrics.increment_stream_errors();
                }
                tracing::debug!(id = conn.id(), %stage, "connection error: {}", e);
            }
        }

        if result.is_err() {
            conn.set_state(ConnectionState::Error);
        }
        conn.set_state(ConnectionState::Closed);
        self.metrics.add_bytes_received(conn.bytes_read());
        self.metrics.add_bytes_sent(conn.bytes_written());
        self.metrics.decrement_connections();
        self.connections.remove(conn.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl ConnectionFactory for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn serve(&self, conn: Arc<Connection>, mut downstream: Stream) -> Result<()> {
            conn.set_state(ConnectionState::Stream);
            let mut buf = [0u8; 1024];
            loop {
                let n = downstream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                downstream.write_all(&buf[..n]).await?;
            }
        }
    }

    fn server(max_listens: usize) -> ContentServer {
        ContentServer::new(
            Arc::new(Echo),
            ContentServerOptions {
                max_listens,
                ..ContentServerOptions::default()
            },
        )
    }

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_echo_and_connection_count() {
        let server = server(4);
        let addr = server.listen(any_port(), 128).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(server.current_connections(), 1);

        drop(client);
        for _ in 0..100 {
            if server.current_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.current_connections(), 0);
        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.bytes_received, 4);
    }

    #[tokio::test]
    async fn test_listen_table_bounded() {
        let server = server(2);
        server.listen(any_port(), 16).await.unwrap();
        server.listen(any_port(), 16).await.unwrap();
        let err = server.listen(any_port(), 16).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(server.local_addrs().len(), 2);
        assert_eq!(server.metrics().listens(), 2);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_everything_and_is_idempotent() {
        let server = server(4);
        let addr = server.listen(any_port(), 128).await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut c = TcpStream::connect(addr).await.unwrap();
            c.write_all(b"x").await.unwrap();
            let mut b = [0u8; 1];
            c.read_exact(&mut b).await.unwrap();
            clients.push(c);
        }
        assert_eq!(server.current_connections(), 3);

        server.stop().await;
        assert_eq!(server.current_connections(), 0);
        assert!(server.local_addrs().is_empty());
        for c in &mut clients {
            let mut b = [0u8; 1];
            assert_eq!(c.read(&mut b).await.unwrap_or(0), 0);
        }

        server.stop().await;
        assert!(server.is_stopped());
        assert!(matches!(server.listen(any_port(), 16).await, Err(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_from_another_thread() {
        let server = server(1);
        server.listen(any_port(), 16).await.unwrap();
        let remote = server.clone();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(remote.stop());
        })
        .join()
        .unwrap();
        assert!(server.is_stopped());
    }
}
