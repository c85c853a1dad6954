//! Name resolution seam.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Asynchronous `host, port -> endpoints` lookup.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` to one or more socket addresses.
    ///
    /// An empty result is reported as [`Error::Resolve`].
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo` on a blocking pool).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl SystemResolver {
    /// Create a system resolver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Resolve(format!("{}: {}", host, e)))?
            .collect();

        if addrs.is_empty() {
            return Err(Error::Resolve(format!("{}: no addresses returned", host)));
        }

        tracing::trace!(host, count = addrs.len(), "resolved");
        Ok(addrs)
    }
}
