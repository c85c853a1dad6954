//! TLS setup for the tunnel leg using rustls.
//!
//! Both ends advertise `h2` ("native" framing) and `http/1.1` ("fallback"
//! framing) through ALPN. In fallback-only mode just `http/1.1` is offered.
//! The server picks the first of its own protocols that the client also
//! offered, so two default peers settle on `h2`.

use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsOptions;
use crate::error::{Error, Result};

/// ALPN token of the native (HTTP/2-style) framing.
pub const ALPN_NATIVE: &[u8] = b"h2";

/// ALPN token of the fallback (HTTP/1.1-style) framing.
pub const ALPN_FALLBACK: &[u8] = b"http/1.1";

/// Protocol identity negotiated through ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnProtocol {
    /// `h2`
    Native,
    /// `http/1.1`
    Fallback,
}

impl AlpnProtocol {
    /// Map a negotiated ALPN token to an identity.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            ALPN_NATIVE => Some(Self::Native),
            ALPN_FALLBACK => Some(Self::Fallback),
            _ => None,
        }
    }

    /// Wire token.
    pub fn token(self) -> &'static [u8] {
        match self {
            Self::Native => ALPN_NATIVE,
            Self::Fallback => ALPN_FALLBACK,
        }
    }
}

impl fmt::Display for AlpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("h2"),
            Self::Fallback => f.write_str("http/1.1"),
        }
    }
}

/// ALPN list offered by either side.
pub fn alpn_protocols(fallback_only: bool) -> Vec<Vec<u8>> {
    if fallback_only {
        vec![ALPN_FALLBACK.to_vec()]
    } else {
        vec![ALPN_NATIVE.to_vec(), ALPN_FALLBACK.to_vec()]
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::tls(format!("{}: {}", path.display(), e)))
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls("no certificates found in PEM"));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM document.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| Error::tls(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| Error::tls("no private key found in PEM"))
}

/// Client half: connector plus the name to verify.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsClient {
    /// Build from configuration, loading `ca_file` if set.
    pub fn from_options(options: &TlsOptions, server_name: &str) -> Result<Self> {
        let extra_roots = match &options.ca_file {
            Some(path) => parse_certs(&read_file(path)?)?,
            None => Vec::new(),
        };
        Self::new(
            server_name,
            extra_roots,
            options.fallback_only,
            options.insecure_skip_verify,
        )
    }

    /// Build a client trusting the web PKI plus `extra_roots`.
    pub fn new(
        server_name: &str,
        extra_roots: Vec<CertificateDer<'static>>,
        fallback_only: bool,
        insecure_skip_verify: bool,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::tls(format!("invalid server name: {}", server_name)))?;

        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(e.to_string()))?;

        let mut config = if insecure_skip_verify {
            tracing::warn!("TLS certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            for cert in extra_roots {
                roots
                    .add(cert)
                    .map_err(|e| Error::tls(format!("invalid CA certificate: {}", e)))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        config.alpn_protocols = alpn_protocols(fallback_only);

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub(crate) fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    /// Name presented via SNI and checked against the certificate.
    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

/// Server half: acceptor with the configured identity.
#[derive(Clone)]
pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServer").finish_non_exhaustive()
    }
}

impl TlsServer {
    /// Build from `cert_file` / `key_file`.
    pub fn from_options(options: &TlsOptions) -> Result<Self> {
        let cert_file = options
            .cert_file
            .as_deref()
            .ok_or_else(|| Error::config("TLS server requires cert_file"))?;
        let key_file = options
            .key_file
            .as_deref()
            .ok_or_else(|| Error::config("TLS server requires key_file"))?;
        Self::from_pem(
            &read_file(cert_file)?,
            &read_file(key_file)?,
            options.fallback_only,
        )
    }

    /// Build from in-memory PEM documents.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], fallback_only: bool) -> Result<Self> {
        let certs = parse_certs(cert_pem)?;
        let key = parse_private_key(key_pem)?;

        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::tls(format!("invalid certificate/key pair: {}", e)))?;
        config.alpn_protocols = alpn_protocols(fallback_only);

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub(crate) fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

/// Accepts any server certificate. Only reachable via `insecure_skip_verify`.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Self-signed `localhost` certificate and key, PEM encoded.
    pub(crate) fn localhost_identity() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    async fn negotiate(client_fallback: bool, server_fallback: bool) -> Option<Vec<u8>> {
        let (cert_pem, key_pem) = localhost_identity();
        let server = TlsServer::from_pem(cert_pem.as_bytes(), key_pem.as_bytes(), server_fallback)
            .unwrap();
        let roots = parse_certs(cert_pem.as_bytes()).unwrap();
        let client = TlsClient::new("localhost", roots, client_fallback, false).unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let mut tls = server.acceptor().accept(b).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut tls = client
            .connector()
            .connect(client.server_name().clone(), a)
            .await
            .unwrap();
        tls.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        tls.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        server_task.await.unwrap();

        tls.get_ref().1.alpn_protocol().map(|p| p.to_vec())
    }

    #[test]
    fn test_alpn_identity() {
        assert_eq!(AlpnProtocol::from_token(b"h2"), Some(AlpnProtocol::Native));
        assert_eq!(AlpnProtocol::from_token(b"http/1.1"), Some(AlpnProtocol::Fallback));
        assert_eq!(AlpnProtocol::from_token(b"spdy/3"), None);
        assert_eq!(AlpnProtocol::Native.to_string(), "h2");
        assert_eq!(alpn_protocols(true), vec![b"http/1.1".to_vec()]);
        assert_eq!(alpn_protocols(false).len(), 2);
    }

    #[tokio::test]
    async fn test_alpn_prefers_native() {
        assert_eq!(negotiate(false, false).await.as_deref(), Some(ALPN_NATIVE));
    }

    #[tokio::test]
    async fn test_alpn_fallback_only_client() {
        assert_eq!(negotiate(true, false).await.as_deref(), Some(ALPN_FALLBACK));
    }

    #[tokio::test]
    async fn test_alpn_fallback_only_server() {
        assert_eq!(negotiate(false, true).await.as_deref(), Some(ALPN_FALLBACK));
    }

    #[test]
    fn test_bad_pem_rejected() {
        assert!(parse_certs(b"not a pem").is_err());
        assert!(parse_private_key(b"").is_err());
        assert!(TlsServer::from_pem(b"", b"", false).is_err());
    }

    #[test]
    fn test_insecure_client_builds() {
        let client = TlsClient::new("example.com", Vec::new(), false, true).unwrap();
        assert_eq!(
            client.server_name(),
            &ServerName::try_from("example.com").unwrap()
        );
    }
}
