//! Runtime configuration.
//!
//! A single read-only snapshot shared by the local (SOCKS5) and server
//! (Shadowsocks-framed) roles. Files ending in `.toml` are parsed as TOML,
//! anything else as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{kdf, CipherSuite, MAX_CHUNK_SIZE};
use crate::error::{Error, Result};

/// Where the SOCKS5 role sends its upstream leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalMode {
    /// Encrypted tunnel to the configured server.
    #[default]
    Tunnel,
    /// Resolve and dial the requested target directly.
    Direct,
}

/// TLS settings for the tunnel leg.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Wrap the tunnel in TLS
    pub enabled: bool,
    /// Offer only `http/1.1` during ALPN
    pub fallback_only: bool,
    /// Server name to present and verify (defaults to `server_host`)
    pub sni: Option<String>,
    /// Extra PEM trust anchors for the client side
    pub ca_file: Option<PathBuf>,
    /// Skip certificate verification (testing only)
    pub insecure_skip_verify: bool,
    /// PEM certificate chain for the server side
    pub cert_file: Option<PathBuf>,
    /// PEM private key for the server side
    pub key_file: Option<PathBuf>,
}

/// Platform socket policy knobs, applied best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
    /// Keepalive idle time in seconds
    pub tcp_keepalive_secs: Option<u64>,
    /// SO_SNDBUF override
    pub send_buffer: Option<usize>,
    /// SO_RCVBUF override
    pub recv_buffer: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive_secs: Some(60),
            send_buffer: None,
            recv_buffer: None,
        }
    }
}

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunnel server host
    pub server_host: String,
    /// Tunnel server port
    pub server_port: u16,
    /// Local listen host
    pub local_host: String,
    /// Local listen port (0 picks an ephemeral port)
    pub local_port: u16,
    /// Cipher suite name
    pub method: CipherSuite,
    /// Shared password (ignored when `key` is set)
    pub password: String,
    /// Raw master key, base64
    pub key: Option<String>,
    /// Upstream connect timeout
    pub connect_timeout_ms: u64,
    /// Wrap tunnel chunks in padding frames
    pub padding_support: bool,
    /// Listen backlog
    pub backlog: u32,
    /// Maximum concurrent listening sockets per acceptor
    pub max_listens: usize,
    /// Queued bytes per direction above which reads pause
    pub high_water_mark: usize,
    /// DNS-over-HTTPS endpoint (accepted for compatibility)
    pub doh_url: Option<String>,
    /// DNS-over-TLS host (accepted for compatibility)
    pub dot_host: Option<String>,
    /// Upstream mode for the SOCKS5 role
    pub local_mode: LocalMode,
    /// TLS settings
    pub tls: TlsOptions,
    /// Socket policy
    pub socket: SocketOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".into(),
            server_port: 8443,
            local_host: "127.0.0.1".into(),
            local_port: 1080,
            method: CipherSuite::default(),
            password: String::new(),
            key: None,
            connect_timeout_ms: crate::DEFAULT_CONNECT_TIMEOUT_MS,
            padding_support: true,
            backlog: 1024,
            max_listens: 16,
            high_water_mark: 1 << 20,
            doh_url: None,
            dot_host: None,
            local_mode: LocalMode::default(),
            tls: TlsOptions::default(),
            socket: SocketOptions::default(),
        }
    }
}

impl Config {
    /// Load from a TOML or JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// Parse TOML.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::config(format!("invalid TOML: {}", e)))
    }

    /// Parse JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::config(format!("invalid JSON: {}", e)))
    }

    /// Serialize as pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `server_host:server_port`
    pub fn server_addr(&self) -> String {
        join_host_port(&self.server_host, self.server_port)
    }

    /// `local_host:local_port`
    pub fn local_addr(&self) -> String {
        join_host_port(&self.local_host, self.local_port)
    }

    /// Server name used for TLS (SNI and verification).
    pub fn tls_server_name(&self) -> &str {
        self.tls.sni.as_deref().unwrap_or(&self.server_host)
    }

    /// Master key bytes: the decoded `key`, or the password-derived key.
    pub fn master_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let key_size = self.method.key_size();
        match &self.key {
            Some(encoded) => {
                let raw = Zeroizing::new(
                    STANDARD
                        .decode(encoded.trim())
                        .map_err(|e| Error::config(format!("invalid base64 key: {}", e)))?,
                );
                if raw.len() != key_size {
                    return Err(Error::config(format!(
                        "{} requires a {}-byte key, got {}",
                        self.method,
                        key_size,
                        raw.len()
                    )));
                }
                Ok(raw)
            }
            None => Ok(kdf::password_to_key(&self.password, key_size)),
        }
    }

    /// Validate settings common to both roles.
    pub fn validate(&self) -> Result<()> {
        if self.local_host.is_empty() {
            return Err(Error::config("local_host cannot be empty"));
        }
        if self.server_host.is_empty() {
            return Err(Error::config("server_host cannot be empty"));
        }
        if self.key.is_none() && self.password.is_empty() && self.method.key_size() > 0 {
            return Err(Error::config("either password or key must be set"));
        }
        self.master_key()?;
        if self.connect_timeout_ms == 0 {
            return Err(Error::config("connect_timeout_ms must be positive"));
        }
        if self.backlog == 0 {
            return Err(Error::config("backlog must be positive"));
        }
        if self.max_listens == 0 {
            return Err(Error::config("max_listens must be positive"));
        }
        if self.high_water_mark < MAX_CHUNK_SIZE {
            return Err(Error::config(format!(
                "high_water_mark must be at least {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        if self.tls.enabled && self.tls.insecure_skip_verify {
            tracing::warn!("TLS certificate verification disabled");
        }
        Ok(())
    }

    /// Validate settings required by the server role.
    pub fn validate_server(&self) -> Result<()> {
        self.validate()?;
        if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(Error::config("TLS server requires cert_file and key_file"));
        }
        Ok(())
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
