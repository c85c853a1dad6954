//! Uniform byte stream over plain TCP or TLS.
//!
//! A [`Stream`] is chosen once at construction (plain, TLS client or TLS
//! server) and then exposes `AsyncRead`/`AsyncWrite`. Reads and writes may
//! be in flight at the same time; each direction allows one operation at a
//! time through `&mut` access.
//!
//! Byte counters measure wire bytes below TLS, so they include record
//! overhead and never reflect decrypted payload sizes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

use crate::error::{Error, Result};
use crate::net::socket_policy::SocketPolicy;
use crate::net::tls::{AlpnProtocol, TlsClient, TlsServer};
use crate::stats;

/// Read/write byte totals of one stream.
#[derive(Debug, Default)]
pub struct StreamCounters {
    read: AtomicU64,
    written: AtomicU64,
}

impl StreamCounters {
    /// Bytes read from the socket.
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Bytes written to the socket.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Socket wrapper feeding per-stream and process-wide counters.
struct Counted<S> {
    inner: S,
    counters: Arc<StreamCounters>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Counted<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = (buf.filled().len() - before) as u64;
            self.counters.read.fetch_add(n, Ordering::Relaxed);
            stats::add_rx(n);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Counted<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.counters.written.fetch_add(n as u64, Ordering::Relaxed);
            stats::add_tx(n as u64);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

enum Transport {
    Plain(Counted<TcpStream>),
    TlsClient(Box<client::TlsStream<Counted<TcpStream>>>),
    TlsServer(Box<server::TlsStream<Counted<TcpStream>>>),
}

/// One connected endpoint.
pub struct Stream {
    transport: Option<Transport>,
    counters: Arc<StreamCounters>,
    alpn: Option<AlpnProtocol>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    shutdown: bool,
}

impl Stream {
    fn counted(tcp: TcpStream) -> Result<(Counted<TcpStream>, SocketAddr, SocketAddr)> {
        let local_addr = tcp.local_addr()?;
        let peer_addr = tcp.peer_addr()?;
        let counted = Counted {
            inner: tcp,
            counters: Arc::new(StreamCounters::default()),
        };
        Ok((counted, local_addr, peer_addr))
    }

    fn from_transport(
        transport: Transport,
        counters: Arc<StreamCounters>,
        alpn: Option<AlpnProtocol>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            transport: Some(transport),
            counters,
            alpn,
            local_addr,
            peer_addr,
            shutdown: false,
        }
    }

    /// Wrap an already connected plain socket.
    pub fn plain(tcp: TcpStream) -> Result<Self> {
        let (counted, local_addr, peer_addr) = Self::counted(tcp)?;
        let counters = Arc::clone(&counted.counters);
        Ok(Self::from_transport(
            Transport::Plain(counted),
            counters,
            None,
            local_addr,
            peer_addr,
        ))
    }

    /// Dial the first reachable address, then run the TLS client handshake
    /// when `tls` is set.
    ///
    /// The whole sequence is bounded by `timeout`; on expiry nothing is kept
    /// and [`Error::Timeout`] is returned.
    pub async fn connect(
        addrs: &[SocketAddr],
        tls: Option<&TlsClient>,
        policy: &SocketPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        tokio::time::timeout(timeout, Self::connect_inner(addrs, tls, policy))
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
    }

    async fn connect_inner(
        addrs: &[SocketAddr],
        tls: Option<&TlsClient>,
        policy: &SocketPolicy,
    ) -> Result<Self> {
        let mut last_error = None;

        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(tcp) => {
                    policy.apply(&tcp);
                    tracing::trace!(%addr, tls = tls.is_some(), "upstream TCP connected");
                    return match tls {
                        Some(tls) => Self::client_handshake(tcp, tls).await,
                        None => Self::plain(tcp),
                    };
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => Error::Network(e),
            None => Error::Resolve("no addresses to connect to".into()),
        })
    }

    async fn client_handshake(tcp: TcpStream, tls: &TlsClient) -> Result<Self> {
        let (counted, local_addr, peer_addr) = Self::counted(tcp)?;
        let counters = Arc::clone(&counted.counters);
        let stream = tls
            .connector()
            .connect(tls.server_name().clone(), counted)
            .await
            .map_err(|e| Error::tls(format!("client handshake with {}: {}", peer_addr, e)))?;

        let alpn = stream
            .get_ref()
            .1
            .alpn_protocol()
            .and_then(AlpnProtocol::from_token);
        Ok(Self::from_transport(
            Transport::TlsClient(Box::new(stream)),
            counters,
            alpn,
            local_addr,
            peer_addr,
        ))
    }

    /// Wrap an accepted socket, running the TLS server handshake when `tls`
    /// is set. The handshake is bounded by `timeout`.
    pub async fn accept(
        tcp: TcpStream,
        tls: Option<&TlsServer>,
        timeout: Duration,
    ) -> Result<Self> {
        let tls = match tls {
            Some(tls) => tls,
            None => return Self::plain(tcp),
        };

        let (counted, local_addr, peer_addr) = Self::counted(tcp)?;
        let counters = Arc::clone(&counted.counters);
        let stream = tokio::time::timeout(timeout, tls.acceptor().accept(counted))
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| Error::tls(format!("server handshake with {}: {}", peer_addr, e)))?;

        let alpn = stream
            .get_ref()
            .1
            .alpn_protocol()
            .and_then(AlpnProtocol::from_token);
        Ok(Self::from_transport(
            Transport::TlsServer(Box::new(stream)),
            counters,
            alpn,
            local_addr,
            peer_addr,
        ))
    }

    /// Whether the OS handle is still open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether this stream runs over TLS.
    pub fn is_tls(&self) -> bool {
        matches!(
            self.transport,
            Some(Transport::TlsClient(_)) | Some(Transport::TlsServer(_))
        )
    }

    /// Protocol identity negotiated through ALPN, if any.
    pub fn alpn(&self) -> Option<AlpnProtocol> {
        self.alpn
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Wire bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes_read()
    }

    /// Wire bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.counters.bytes_written()
    }

    /// Shared handle to this stream's counters; outlives the stream.
    pub fn counters(&self) -> Arc<StreamCounters> {
        Arc::clone(&self.counters)
    }

    /// Drop the OS handle. Later reads report EOF and writes fail with
    /// `NotConnected`.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            tracing::trace!(peer = %self.peer_addr, "stream closed");
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.is_tls())
            .field("alpn", &self.alpn)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().transport.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(Transport::Plain(s)) => Pin::new(s).poll_read(cx, buf),
            Some(Transport::TlsClient(s)) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Some(Transport::TlsServer(s)) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shutdown {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        match this.transport.as_mut() {
            None => Poll::Ready(Err(not_connected())),
            Some(Transport::Plain(s)) => Pin::new(s).poll_write(cx, buf),
            Some(Transport::TlsClient(s)) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Some(Transport::TlsServer(s)) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().transport.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(Transport::Plain(s)) => Pin::new(s).poll_flush(cx),
            Some(Transport::TlsClient(s)) => Pin::new(s.as_mut()).poll_flush(cx),
            Some(Transport::TlsServer(s)) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    /// Half-close the write direction (TLS sends `close_notify` first).
    /// Only the first call has an effect.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shutdown {
            return Poll::Ready(Ok(()));
        }
        let res = match this.transport.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(Transport::Plain(s)) => Pin::new(s).poll_shutdown(cx),
            Some(Transport::TlsClient(s)) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Some(Transport::TlsServer(s)) => Pin::new(s.as_mut()).poll_shutdown(cx),
        };
        match res {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) if e.kind() != io::ErrorKind::NotConnected => Poll::Ready(Err(e)),
            Poll::Ready(_) => {
                this.shutdown = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}
