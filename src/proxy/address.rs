//! Target address encoding shared by SOCKS5 requests and the Shadowsocks
//! request header: `ATYP(1) ADDR PORT(2, big-endian)`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};
use crate::net::Resolver;

/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type.
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type.
pub const ATYP_IPV6: u8 = 0x04;

/// Largest encoded address: ATYP + length + 255-byte domain + port.
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

/// Destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal IP address
    Ip(SocketAddr),
    /// Name still to be resolved
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse an address from the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed; `Ok(Some((addr, n)))` means
    /// the first `n` bytes held `addr`. An unknown address type or an
    /// invalid domain is an error.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };

        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7)))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                let ip = IpAddr::V6(Ipv6Addr::from(octets));
                Ok(Some((TargetAddr::Ip(SocketAddr::new(ip, port)), 19)))
            }
            ATYP_DOMAIN => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                if len == 0 {
                    return Err(Error::invalid("empty domain name"));
                }
                let total = 2 + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                let host = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| Error::invalid("domain name is not valid UTF-8"))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((TargetAddr::Domain(host.to_string(), port), total)))
            }
            other => Err(Error::UnsupportedAddressType(other)),
        }
    }

    /// Append the wire encoding to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(host, port) => {
                if host.is_empty() || host.len() > 255 {
                    return Err(Error::invalid(format!(
                        "domain name length {} out of range",
                        host.len()
                    )));
                }
                out.push(ATYP_DOMAIN);
                out.push(host.len() as u8);
                out.extend_from_slice(host.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Wire encoding as a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(MAX_ADDR_LEN);
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Endpoints to dial; literal addresses skip the resolver.
    pub async fn resolve(&self, resolver: &dyn Resolver) -> Result<Vec<SocketAddr>> {
        match self {
            TargetAddr::Ip(addr) => Ok(vec![*addr]),
            TargetAddr::Domain(host, port) => resolver.resolve(host, *port).await,
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}
