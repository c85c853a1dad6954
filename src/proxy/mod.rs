//! Proxy protocols.
//!
//! Local side: a listener speaking SOCKS5, SOCKS4/4a and HTTP proxy
//! requests, whose upstream leg is either the encrypted tunnel or a direct
//! connection to the requested target.
//! Server side: the tunnel endpoint, which reads the encrypted request
//! header and relays to the target on behalf of the client.

pub mod address;
pub mod http;
pub mod relay;
pub mod shadowsocks;
pub mod socks4;
pub mod socks5;

pub use address::TargetAddr;
pub use relay::{BoxedTransform, Passthrough, PendingWriteQueue, Relay, RelayStats, Transform};
pub use shadowsocks::ShadowsocksFactory;
pub use socks5::{Socks5Factory, Upstream};

pub use crate::server::ConnectionFactory;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::config::Config;
use crate::crypto::{ChunkDecoder, ChunkEncoder, CipherSuite};
use crate::error::{Error, Result};

/// Tunnel cipher parameters shared by every connection of one role.
#[derive(Clone)]
pub struct CipherSettings {
    suite: CipherSuite,
    master_key: Zeroizing<Vec<u8>>,
    padded: bool,
}

impl CipherSettings {
    /// Settings for `suite` keyed with `master_key`.
    pub fn new(suite: CipherSuite, master_key: &[u8], padded: bool) -> Result<Self> {
        if master_key.len() != suite.key_size() {
            return Err(Error::crypto(format!(
                "{} requires a {}-byte key, got {}",
                suite,
                suite.key_size(),
                master_key.len()
            )));
        }
        Ok(Self {
            suite,
            master_key: Zeroizing::new(master_key.to_vec()),
            padded,
        })
    }

    /// Settings from `method`, `key`/`password` and `padding_support`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let key = config.master_key()?;
        Self::new(config.method, &key, config.padding_support)
    }

    /// Cipher suite.
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Whether chunks carry padding frames.
    pub fn padded(&self) -> bool {
        self.padded
    }

    /// Fresh sending context with a new random salt.
    pub fn encoder(&self) -> Result<ChunkEncoder> {
        ChunkEncoder::new(self.suite, &self.master_key, self.padded)
    }

    /// Fresh receiving context; the salt is taken from the wire.
    pub fn decoder(&self) -> ChunkDecoder {
        ChunkDecoder::new(self.suite, &self.master_key, self.padded)
    }
}

impl fmt::Debug for CipherSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSettings")
            .field("suite", &self.suite)
            .field("padded", &self.padded)
            .finish_non_exhaustive()
    }
}

/// Run `fut`, failing with [`Error::Timeout`] if it outlives `timeout`.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
}
