//! # sockscipher
//!
//! A TLS-capable forward proxy. A local endpoint speaking SOCKS5, SOCKS4/4a
//! and HTTP proxy requests accepts client connections and relays them either directly to the requested target or
//! through an encrypted, length-padded tunnel to a Shadowsocks-framed
//! server, optionally wrapped in TLS with ALPN-based fallback.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Worker / ServerWorker   (start, stop, connection count) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Protocol connections    (SOCKS/HTTP, Shadowsocks-framed)│
//! ├─────────────────────────────────────────────────────────┤
//! │  ContentServer           (listen table, accept, ALPN)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Stream                  (plain / TLS client / TLS srv)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Padding codec  +  Packet-numbered AEAD (chunk framing)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data path
//!
//! Client bytes are read from the downstream stream, pass through the
//! cipher and the padding codec (tunnel legs only), and are queued for the
//! upstream stream. Each direction keeps its own pending write queue with
//! one write in flight; reads pause while the queue sits above its
//! high-water mark.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod padding;
pub mod proxy;
pub mod server;
pub mod stats;
pub mod worker;

pub use config::{Config, LocalMode};
pub use error::{Error, Result};
pub use worker::{ServerWorker, Worker};

/// SOCKS protocol version byte
pub const SOCKS_VERSION: u8 = 0x05;

/// Default timeout for upstream connects and TLS handshakes (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Read buffer size per relay direction
pub const SOCKET_BUF_SIZE: usize = 16 * 1024;
