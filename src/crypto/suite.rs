//! Cipher suite catalogue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// How the per-packet nonce is derived from the fixed nonce material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceScheme {
    /// `prefix (nonce_size - 8 bytes) || big_endian(packet_number)`
    Prefix,
    /// Full-size IV with the little-endian packet number XORed into its first 8 bytes.
    Iv,
}

/// Supported cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    /// No encryption; payload passes through unchanged.
    Plaintext,
    /// AES-128-GCM, 16-byte tag
    Aes128Gcm,
    /// AES-128-GCM with a truncated 12-byte tag
    Aes128Gcm12,
    /// AES-192-GCM
    Aes192Gcm,
    /// AES-256-GCM
    Aes256Gcm,
    /// ChaCha20-Poly1305 (IETF, 96-bit nonce)
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 (192-bit nonce)
    XChaCha20Poly1305,
    /// Salsa20 stream cipher, no authentication
    Salsa20,
    /// ChaCha20 stream cipher with the original 64-bit nonce, no authentication
    ChaCha20,
    /// ChaCha20 stream cipher with the IETF 96-bit nonce, no authentication
    ChaCha20Ietf,
}

impl CipherSuite {
    /// Every suite, in catalogue order.
    pub const ALL: [CipherSuite; 10] = [
        CipherSuite::Plaintext,
        CipherSuite::Aes128Gcm,
        CipherSuite::Aes128Gcm12,
        CipherSuite::Aes192Gcm,
        CipherSuite::Aes256Gcm,
        CipherSuite::ChaCha20Poly1305,
        CipherSuite::XChaCha20Poly1305,
        CipherSuite::Salsa20,
        CipherSuite::ChaCha20,
        CipherSuite::ChaCha20Ietf,
    ];

    /// Key size in bytes.
    pub const fn key_size(self) -> usize {
        match self {
            CipherSuite::Plaintext => 0,
            CipherSuite::Aes128Gcm | CipherSuite::Aes128Gcm12 => 16,
            CipherSuite::Aes192Gcm => 24,
            _ => 32,
        }
    }

    /// Authentication tag size in bytes (0 for unauthenticated suites).
    pub const fn tag_size(self) -> usize {
        match self {
            CipherSuite::Plaintext
            | CipherSuite::Salsa20
            | CipherSuite::ChaCha20
            | CipherSuite::ChaCha20Ietf => 0,
            CipherSuite::Aes128Gcm12 => 12,
            _ => 16,
        }
    }

    /// Nonce size in bytes.
    pub const fn nonce_size(self) -> usize {
        match self {
            CipherSuite::Plaintext => 0,
            CipherSuite::Salsa20 | CipherSuite::ChaCha20 => 8,
            CipherSuite::XChaCha20Poly1305 => 24,
            _ => 12,
        }
    }

    /// Nonce construction family.
    pub const fn nonce_scheme(self) -> NonceScheme {
        match self {
            CipherSuite::XChaCha20Poly1305 => NonceScheme::Iv,
            _ => NonceScheme::Prefix,
        }
    }

    /// Whether the suite authenticates its output.
    pub const fn is_aead(self) -> bool {
        self.tag_size() > 0
    }

    /// Size of the fixed nonce material accepted by `set_nonce_prefix` / `set_iv`.
    pub const fn fixed_nonce_size(self) -> usize {
        match self.nonce_scheme() {
            NonceScheme::Prefix => self.nonce_size().saturating_sub(8),
            NonceScheme::Iv => self.nonce_size(),
        }
    }

    /// Canonical configuration name.
    pub const fn name(self) -> &'static str {
        match self {
            CipherSuite::Plaintext => "plaintext",
            CipherSuite::Aes128Gcm => "aes-128-gcm",
            CipherSuite::Aes128Gcm12 => "aes-128-gcm12",
            CipherSuite::Aes192Gcm => "aes-192-gcm",
            CipherSuite::Aes256Gcm => "aes-256-gcm",
            CipherSuite::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
            CipherSuite::XChaCha20Poly1305 => "xchacha20-ietf-poly1305",
            CipherSuite::Salsa20 => "salsa20",
            CipherSuite::ChaCha20 => "chacha20",
            CipherSuite::ChaCha20Ietf => "chacha20-ietf",
        }
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite::ChaCha20Poly1305
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherSuite {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        CipherSuite::ALL
            .iter()
            .copied()
            .find(|suite| suite.name() == lower)
            .ok_or_else(|| Error::config(format!("unknown cipher method: {}", s)))
    }
}

impl Serialize for CipherSuite {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CipherSuite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
