//! Networking: streams, TLS, name resolution and socket policy.

pub mod resolver;
pub mod socket_policy;
pub mod stream;
pub mod tls;

pub use resolver::{Resolver, SystemResolver};
pub use socket_policy::SocketPolicy;
pub use stream::{Stream, StreamCounters};
pub use tls::{AlpnProtocol, TlsClient, TlsServer};
