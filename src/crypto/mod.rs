//! Cryptographic primitives for the proxy tunnel.
//!
//! This module provides:
//! - The cipher suite catalogue (AES-GCM family, (X)ChaCha20-Poly1305,
//!   unauthenticated stream ciphers, plaintext)
//! - Packet-numbered encrypt/decrypt contexts
//! - Key derivation (password, per-session subkey, diversification)
//! - Chunk framing for encrypted streams
//! - Secure random number generation
//!
//! All secret material is zeroized on drop.

mod aead;
mod framing;
pub mod kdf;
mod random;
mod suite;

pub use aead::{ciphertext_size, max_plaintext_size, Decrypter, Encrypter};
pub use framing::{ChunkDecoder, ChunkEncoder, MAX_CHUNK_SIZE};
pub use random::SecureRandom;
pub use suite::{CipherSuite, NonceScheme};

/// Largest key size of any suite (bytes)
pub const MAX_KEY_SIZE: usize = 64;

/// Largest nonce size of any suite (bytes)
pub const MAX_NONCE_SIZE: usize = 32;
