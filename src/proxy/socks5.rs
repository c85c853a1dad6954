//! Local front end.
//!
//! The first byte of a connection picks the dialect: `0x05` is SOCKS5,
//! `0x04` is SOCKS4/4a ([`super::socks4`]) and an ASCII letter is an HTTP
//! proxy request ([`super::http`]). Anything else is closed.
//!
//! SOCKS5 accepts `CONNECT` requests without authentication. Every dialect
//! opens the upstream leg before replying, so the client learns the real
//! outcome:
//!
//! ```text
//! client                 Socks5Factory                     upstream
//!   │ VER NMETHODS METHODS     │                               │
//!   │─────────────────────────▶│                               │
//!   │◀──────── VER 00 ─────────│                               │
//!   │ VER CMD RSV ATYP ADDR    │                               │
//!   │─────────────────────────▶│ resolve + connect (+ TLS) ───▶│
//!   │◀──── VER REP RSV BND ────│                               │
//!   │◀════════════ relay (tunnel: chunk encoder/decoder) ═════▶│
//! ```
//!
//! In tunnel mode the target travels to the server as the first encrypted
//! chunk (`ATYP ADDR PORT`). In direct mode the target is dialled here.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::address::TargetAddr;
use super::relay::{BoxedTransform, Passthrough, Relay};
use super::{http, socks4, with_timeout, CipherSettings};
use crate::config::{Config, LocalMode};
use crate::error::{Error, Result};
use crate::net::{Resolver, SocketPolicy, Stream, TlsClient};
use crate::server::{Connection, ConnectionFactory, ConnectionState};
use crate::{SOCKET_BUF_SIZE, SOCKS_VERSION};

/// No authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// No acceptable methods.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// `CONNECT` command.
pub const CMD_CONNECT: u8 = 0x01;
/// `BIND` command (not served).
pub const CMD_BIND: u8 = 0x02;
/// `UDP ASSOCIATE` command (not served).
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Reply code for success.
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// A parsed SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command byte
    pub command: u8,
    /// Requested destination
    pub target: TargetAddr,
}

impl Request {
    /// The destination of a `CONNECT`; other commands are refused.
    pub fn into_connect_target(self) -> Result<TargetAddr> {
        match self.command {
            CMD_CONNECT => Ok(self.target),
            other => Err(Error::UnsupportedCommand(other)),
        }
    }
}

/// Parse `VER NMETHODS METHODS...`.
pub fn parse_method_select(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(Error::handshake(format!(
            "unsupported SOCKS version {}",
            buf[0]
        )));
    }
    let count = buf[1] as usize;
    if count == 0 {
        return Err(Error::handshake("no authentication methods offered"));
    }
    if buf.len() < 2 + count {
        return Ok(None);
    }
    Ok(Some((buf[2..2 + count].to_vec(), 2 + count)))
}

/// Parse `VER CMD RSV ATYP ADDR PORT`.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(Error::handshake(format!(
            "unsupported SOCKS version {}",
            buf[0]
        )));
    }
    let command = buf[1];
    Ok(TargetAddr::parse(&buf[3..])?
        .map(|(target, used)| (Request { command, target }, 3 + used)))
}

/// Encode `VER REP RSV ATYP BND.ADDR BND.PORT`.
pub fn encode_reply(reply: u8, bound: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[SOCKS_VERSION, reply, 0x00]);
    match bound {
        SocketAddr::V4(addr) => {
            out.push(super::address::ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            out.push(super::address::ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

fn unspecified() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Read from `stream` into `buf` until `parse` yields a message, then
/// consume it. Bytes past the message stay in `buf`.
async fn read_message<S, T, F>(stream: &mut S, buf: &mut BytesMut, mut parse: F) -> Result<T>
where
    S: AsyncRead + Unpin + ?Sized,
    F: FnMut(&[u8]) -> Result<Option<(T, usize)>>,
{
    loop {
        if let Some((value, used)) = parse(&buf[..])? {
            buf.advance(used);
            return Ok(value);
        }
        if buf.len() >= SOCKET_BUF_SIZE {
            return Err(Error::handshake("request exceeds buffer limit"));
        }
        buf.reserve(SOCKET_BUF_SIZE - buf.len());
        if stream.read_buf(buf).await? == 0 {
            return Err(Error::handshake("client closed during handshake"));
        }
    }
}

/// Where accepted requests are sent.
#[derive(Debug, Clone)]
pub enum Upstream {
    /// Dial the requested target from here.
    Direct,
    /// Send the request through the encrypted tunnel.
    Tunnel {
        /// Tunnel server host
        host: String,
        /// Tunnel server port
        port: u16,
        /// TLS client, when the tunnel runs over TLS
        tls: Option<TlsClient>,
        /// Chunk cipher
        cipher: CipherSettings,
    },
}

/// Protocol factory for the local SOCKS5 listener.
pub struct Socks5Factory {
    upstream: Upstream,
    resolver: Arc<dyn Resolver>,
    policy: SocketPolicy,
    connect_timeout: Duration,
    high_water_mark: usize,
}

impl Socks5Factory {
    /// Create a factory.
    pub fn new(
        upstream: Upstream,
        resolver: Arc<dyn Resolver>,
        policy: SocketPolicy,
        connect_timeout: Duration,
        high_water_mark: usize,
    ) -> Self {
        Self {
            upstream,
            resolver,
            policy,
            connect_timeout,
            high_water_mark,
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &Config, resolver: Arc<dyn Resolver>) -> Result<Self> {
        let upstream = match config.local_mode {
            LocalMode::Direct => Upstream::Direct,
            LocalMode::Tunnel => {
                let tls = if config.tls.enabled {
                    Some(TlsClient::from_options(
                        &config.tls,
                        config.tls_server_name(),
                    )?)
                } else {
                    None
                };
                Upstream::Tunnel {
                    host: config.server_host.clone(),
                    port: config.server_port,
                    tls,
                    cipher: CipherSettings::from_config(config)?,
                }
            }
        };

        Ok(Self::new(
            upstream,
            resolver,
            SocketPolicy::new(config.socket.clone()),
            config.connect_timeout(),
            config.high_water_mark,
        ))
    }

    /// Configured upstream.
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    async fn open_upstream(
        &self,
        target: &TargetAddr,
    ) -> Result<(Stream, Relay<BoxedTransform, BoxedTransform>)> {
        match &self.upstream {
            Upstream::Direct => {
                let addrs = target.resolve(self.resolver.as_ref()).await?;
                let stream =
                    Stream::connect(&addrs, None, &self.policy, self.connect_timeout).await?;
                let relay: Relay<BoxedTransform, BoxedTransform> =
                    Relay::new(Box::new(Passthrough), Box::new(Passthrough), self.high_water_mark);
                Ok((stream, relay))
            }
            Upstream::Tunnel {
                host,
                port,
                tls,
                cipher,
            } => {
                let addrs = self.resolver.resolve(host, *port).await?;
                let stream =
                    Stream::connect(&addrs, tls.as_ref(), &self.policy, self.connect_timeout)
                        .await?;
                if let Some(alpn) = stream.alpn() {
                    tracing::debug!(server = %stream.peer_addr(), %alpn, "tunnel negotiated");
                }

                let mut relay: Relay<BoxedTransform, BoxedTransform> = Relay::new(
                    Box::new(cipher.encoder()?),
                    Box::new(cipher.decoder()),
                    self.high_water_mark,
                );
                relay.push_upstream(&target.to_bytes()?)?;
                Ok((stream, relay))
            }
        }
    }
}

/// Request dialect, which decides how replies are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Socks5,
    Socks4,
    HttpConnect,
    HttpForward,
}

impl Dialect {
    fn success_reply(self, bound: SocketAddr) -> Vec<u8> {
        match self {
            Dialect::Socks5 => encode_reply(REPLY_SUCCEEDED, bound),
            Dialect::Socks4 => socks4::encode_reply(socks4::REPLY_GRANTED).to_vec(),
            Dialect::HttpConnect => http::CONNECT_ESTABLISHED.to_vec(),
            // The forwarded request is answered by the origin.
            Dialect::HttpForward => Vec::new(),
        }
    }

    fn failure_reply(self, err: &Error) -> Vec<u8> {
        match self {
            Dialect::Socks5 => encode_reply(err.socks5_reply_code(), unspecified()),
            Dialect::Socks4 => socks4::encode_reply(socks4::REPLY_REJECTED).to_vec(),
            Dialect::HttpConnect | Dialect::HttpForward => http::error_response(err).to_vec(),
        }
    }
}

/// A request ready to be dialled.
struct Accepted {
    dialect: Dialect,
    target: TargetAddr,
    /// Sent upstream ahead of anything else from the client
    preamble: Vec<u8>,
}

/// Report `err` to the client in its dialect, close, and hand `err` back.
async fn reject(downstream: &mut Stream, dialect: Dialect, err: Error) -> Error {
    let _ = downstream.write_all(&dialect.failure_reply(&err)).await;
    let _ = downstream.shutdown().await;
    err
}

fn peek_first(buf: &[u8]) -> Result<Option<(u8, usize)>> {
    Ok(buf.first().map(|&b| (b, 0)))
}

impl Socks5Factory {
    async fn socks5_handshake(
        &self,
        conn: &Connection,
        downstream: &mut Stream,
        buf: &mut BytesMut,
    ) -> Result<Accepted> {
        let methods = with_timeout(
            self.connect_timeout,
            read_message(downstream, buf, parse_method_select),
        )
        .await?;
        if !methods.contains(&METHOD_NO_AUTH) {
            downstream
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
            let _ = downstream.shutdown().await;
            return Err(Error::handshake("no acceptable authentication method"));
        }
        downstream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

        conn.set_state(ConnectionState::Handshake);
        let request = with_timeout(
            self.connect_timeout,
            read_message(downstream, buf, parse_request),
        )
        .await
        .and_then(Request::into_connect_target);
        match request {
            Ok(target) => Ok(Accepted {
                dialect: Dialect::Socks5,
                target,
                preamble: Vec::new(),
            }),
            Err(e) => Err(reject(downstream, Dialect::Socks5, e).await),
        }
    }

    async fn socks4_handshake(
        &self,
        conn: &Connection,
        downstream: &mut Stream,
        buf: &mut BytesMut,
    ) -> Result<Accepted> {
        conn.set_state(ConnectionState::Handshake);
        let request = with_timeout(
            self.connect_timeout,
            read_message(downstream, buf, socks4::parse_request),
        )
        .await
        .and_then(socks4::Request::into_connect_target);
        match request {
            Ok(target) => Ok(Accepted {
                dialect: Dialect::Socks4,
                target,
                preamble: Vec::new(),
            }),
            Err(e) => Err(reject(downstream, Dialect::Socks4, e).await),
        }
    }

    async fn http_handshake(
        &self,
        conn: &Connection,
        downstream: &mut Stream,
        buf: &mut BytesMut,
    ) -> Result<Accepted> {
        conn.set_state(ConnectionState::Handshake);
        let request = with_timeout(
            self.connect_timeout,
            read_message(downstream, buf, http::parse_request),
        )
        .await;
        match request {
            Ok(request) if request.is_connect() => Ok(Accepted {
                dialect: Dialect::HttpConnect,
                target: request.target,
                preamble: Vec::new(),
            }),
            Ok(request) => {
                tracing::debug!(id = conn.id(), method = %request.method, "forwarding HTTP request");
                Ok(Accepted {
                    dialect: Dialect::HttpForward,
                    target: request.target,
                    preamble: request.forward_head,
                })
            }
            Err(e) => Err(reject(downstream, Dialect::HttpForward, e).await),
        }
    }
}

#[async_trait]
impl ConnectionFactory for Socks5Factory {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn serve(&self, conn: Arc<Connection>, mut downstream: Stream) -> Result<()> {
        let mut buf = BytesMut::with_capacity(512);

        conn.set_state(ConnectionState::MethodSelect);
        let first = with_timeout(
            self.connect_timeout,
            read_message(&mut downstream, &mut buf, peek_first),
        )
        .await?;
        let accepted = match first {
            SOCKS_VERSION => self.socks5_handshake(&conn, &mut downstream, &mut buf).await?,
            socks4::SOCKS4_VERSION => {
                self.socks4_handshake(&conn, &mut downstream, &mut buf).await?
            }
            b if http::is_method_start(b) => {
                self.http_handshake(&conn, &mut downstream, &mut buf).await?
            }
            other => {
                let _ = downstream.shutdown().await;
                return Err(Error::handshake(format!(
                    "unrecognized request byte {:#04x}",
                    other
                )));
            }
        };
        let Accepted {
            dialect,
            target,
            preamble,
        } = accepted;
        tracing::debug!(id = conn.id(), %target, ?dialect, "CONNECT");

        let opened = with_timeout(self.connect_timeout, self.open_upstream(&target)).await;
        let (mut upstream, mut relay) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::debug!(id = conn.id(), %target, error = %e, "upstream failed");
                return Err(reject(&mut downstream, dialect, e).await);
            }
        };

        let reply = dialect.success_reply(upstream.local_addr());
        if !reply.is_empty() {
            downstream.write_all(&reply).await?;
        }
        conn.set_state(ConnectionState::Stream);

        if !preamble.is_empty() {
            relay.push_upstream(&preamble)?;
        }
        // Data the client pipelined behind its request.
        if !buf.is_empty() {
            relay.push_upstream(&buf)?;
        }

        let stats = relay.run(&mut downstream, &mut upstream).await?;
        tracing::debug!(
            id = conn.id(),
            %target,
            sent = stats.upstream_read,
            received = stats.downstream_written,
            "relay finished"
        );
        Ok(())
    }
}
