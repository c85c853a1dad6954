//! Tunnel server side.
//!
//! The first decrypted bytes of every connection are the request header
//! (`ATYP ADDR PORT`); whatever follows it is client payload. A header that
//! fails to decrypt or parse, a target that does not resolve, and a target
//! that refuses the connection all end the same way: the connection is
//! closed without a reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::address::TargetAddr;
use super::relay::Relay;
use super::{with_timeout, CipherSettings};
use crate::config::Config;
use crate::crypto::ChunkDecoder;
use crate::error::{Error, Result};
use crate::net::{Resolver, SocketPolicy, Stream};
use crate::server::{Connection, ConnectionFactory, ConnectionState};
use crate::SOCKET_BUF_SIZE;

/// Protocol factory for the tunnel server listener.
pub struct ShadowsocksFactory {
    cipher: CipherSettings,
    resolver: Arc<dyn Resolver>,
    policy: SocketPolicy,
    connect_timeout: Duration,
    high_water_mark: usize,
}

impl ShadowsocksFactory {
    /// Create a factory.
    pub fn new(
        cipher: CipherSettings,
        resolver: Arc<dyn Resolver>,
        policy: SocketPolicy,
        connect_timeout: Duration,
        high_water_mark: usize,
    ) -> Self {
        Self {
            cipher,
            resolver,
            policy,
            connect_timeout,
            high_water_mark,
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &Config, resolver: Arc<dyn Resolver>) -> Result<Self> {
        Ok(Self::new(
            CipherSettings::from_config(config)?,
            resolver,
            SocketPolicy::new(config.socket.clone()),
            config.connect_timeout(),
            config.high_water_mark,
        ))
    }
}

/// Decrypt from `stream` until a complete header is available.
///
/// Returns the target and the plaintext that followed it.
async fn read_header(
    stream: &mut Stream,
    decoder: &mut ChunkDecoder,
) -> Result<(TargetAddr, Vec<u8>)> {
    let mut wire = vec![0u8; SOCKET_BUF_SIZE];
    let mut plain = Vec::new();
    loop {
        let n = stream.read(&mut wire).await?;
        if n == 0 {
            return Err(Error::handshake("client closed before request header"));
        }
        decoder.decode(&wire[..n], &mut plain)?;
        if let Some((target, used)) = TargetAddr::parse(&plain)? {
            plain.drain(..used);
            return Ok((target, plain));
        }
    }
}

#[async_trait]
impl ConnectionFactory for ShadowsocksFactory {
    fn name(&self) -> &'static str {
        "shadowsocks"
    }

    async fn serve(&self, conn: Arc<Connection>, mut downstream: Stream) -> Result<()> {
        let mut decoder = self.cipher.decoder();
        let (target, early) =
            with_timeout(self.connect_timeout, read_header(&mut downstream, &mut decoder)).await?;
        tracing::debug!(id = conn.id(), %target, "tunnel request");

        let mut upstream = with_timeout(self.connect_timeout, async {
            let addrs = target.resolve(self.resolver.as_ref()).await?;
            Stream::connect(&addrs, None, &self.policy, self.connect_timeout).await
        })
        .await
        .map_err(|e| {
            tracing::debug!(id = conn.id(), %target, error = %e, "target unreachable");
            e
        })?;

        let mut relay = Relay::new(decoder, self.cipher.encoder()?, self.high_water_mark);
        if !early.is_empty() {
            relay.push_upstream_raw(Bytes::from(early));
        }
        conn.set_state(ConnectionState::Stream);

        let stats = relay.run(&mut downstream, &mut upstream).await?;
        tracing::debug!(
            id = conn.id(),
            %target,
            sent = stats.upstream_written,
            received = stats.downstream_read,
            "relay finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{kdf, ChunkEncoder, CipherSuite};
    use crate::net::SystemResolver;
    use crate::server::{ContentServer, ContentServerOptions};
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    const SUITE: CipherSuite = CipherSuite::ChaCha20Poly1305;

    struct FailingResolver;

    #[async_trait]
    impl Resolver for FailingResolver {
        async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<SocketAddr>> {
            Err(Error::Resolve(format!("{}: no such host", host)))
        }
    }

    fn key() -> Vec<u8> {
        kdf::password_to_key("tunnel", SUITE.key_size()).to_vec()
    }

    async fn start(resolver: Arc<dyn Resolver>) -> (ContentServer, SocketAddr) {
        let factory = ShadowsocksFactory::new(
            CipherSettings::new(SUITE, &key(), true).unwrap(),
            resolver,
            SocketPolicy::default(),
            Duration::from_secs(5),
            1 << 20,
        );
        let server = ContentServer::new(Arc::new(factory), ContentServerOptions::default());
        let addr = server
            .listen("127.0.0.1:0".parse().unwrap(), 128)
            .await
            .unwrap();
        (server, addr)
    }

    async fn assert_silent_close(client: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_header_and_payload_relayed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut got = [0u8; 5];
            socket.read_exact(&mut got).await.unwrap();
            socket.write_all(b"world").await.unwrap();
            got
        });

        let (server, addr) = start(Arc::new(SystemResolver)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut encoder = ChunkEncoder::new(SUITE, &key(), true).unwrap();
        let mut first = TargetAddr::from(target).to_bytes().unwrap();
        first.extend_from_slice(b"hello");
        let mut wire = Vec::new();
        encoder.encode(&first, &mut wire).unwrap();
        client.write_all(&wire).await.unwrap();

        assert_eq!(&upstream.await.unwrap(), b"hello");

        let mut decoder = ChunkDecoder::new(SUITE, &key(), true);
        let mut plain = Vec::new();
        let mut buf = [0u8; 1024];
        while plain.len() < 5 {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            decoder.decode(&buf[..n], &mut plain).unwrap();
        }
        assert_eq!(plain, b"world");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_key_closes_silently() {
        let (server, addr) = start(Arc::new(SystemResolver)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let other = kdf::password_to_key("not the tunnel", SUITE.key_size());
        let mut encoder = ChunkEncoder::new(SUITE, &other, true).unwrap();
        let mut wire = Vec::new();
        let header = TargetAddr::Domain("example.com".into(), 80);
        encoder.encode(&header.to_bytes().unwrap(), &mut wire).unwrap();
        client.write_all(&wire).await.unwrap();

        assert_silent_close(&mut client).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bad_address_type_closes_silently() {
        let (server, addr) = start(Arc::new(SystemResolver)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut encoder = ChunkEncoder::new(SUITE, &key(), true).unwrap();
        let mut wire = Vec::new();
        encoder.encode(&[0x09, 1, 2, 3, 4, 0, 80], &mut wire).unwrap();
        client.write_all(&wire).await.unwrap();

        assert_silent_close(&mut client).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unresolvable_target_closes_silently() {
        let (server, addr) = start(Arc::new(FailingResolver)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut encoder = ChunkEncoder::new(SUITE, &key(), true).unwrap();
        let mut wire = Vec::new();
        let header = TargetAddr::Domain("nowhere.invalid".into(), 443);
        encoder.encode(&header.to_bytes().unwrap(), &mut wire).unwrap();
        client.write_all(&wire).await.unwrap();

        assert_silent_close(&mut client).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.current_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.metrics().handshake_errors(), 1);
        server.stop().await;
    }
}
