//! SOCKS4 and SOCKS4a requests on the local listener.
//!
//! ```text
//! VN(1)=4 CD(1) DSTPORT(2) DSTIP(4) USERID... NUL [DOMAIN... NUL]
//! ```
//!
//! A `DSTIP` of `0.0.0.x` with `x != 0` marks a SOCKS4a request whose
//! destination is the domain following the user id. Replies are eight bytes:
//! `00 CD 00 00 00 00 00 00`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::address::TargetAddr;
use crate::error::{Error, Result};

/// Protocol version byte.
pub const SOCKS4_VERSION: u8 = 0x04;

/// `CONNECT` command.
pub const CMD_CONNECT: u8 = 0x01;
/// `BIND` command (not served).
pub const CMD_BIND: u8 = 0x02;

/// Request granted.
pub const REPLY_GRANTED: u8 = 0x5a;
/// Request rejected or failed.
pub const REPLY_REJECTED: u8 = 0x5b;

const HEADER_LEN: usize = 8;
const MAX_DOMAIN_LEN: usize = 255;

/// A parsed SOCKS4 or SOCKS4a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command byte
    pub command: u8,
    /// Requested destination
    pub target: TargetAddr,
    /// Client-supplied user id (ignored)
    pub user_id: String,
}

impl Request {
    /// The destination of a `CONNECT`; other commands are refused.
    pub fn into_connect_target(self) -> Result<TargetAddr> {
        match self.command {
            CMD_CONNECT => Ok(self.target),
            other => Err(Error::UnsupportedCommand(other)),
        }
    }
}

fn nul_terminated(buf: &[u8]) -> Option<(&[u8], usize)> {
    buf.iter().position(|&b| b == 0).map(|end| (&buf[..end], end + 1))
}

/// Parse a request from the front of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != SOCKS4_VERSION {
        return Err(Error::handshake(format!(
            "unsupported SOCKS version {}",
            buf[0]
        )));
    }
    let command = buf[1];
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

    let Some((user_id, used)) = nul_terminated(&buf[HEADER_LEN..]) else {
        return Ok(None);
    };
    let user_id = String::from_utf8_lossy(user_id).into_owned();
    let mut pos = HEADER_LEN + used;

    let octets = ip.octets();
    let target = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let Some((domain, used)) = nul_terminated(&buf[pos..]) else {
            return Ok(None);
        };
        pos += used;
        if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
            return Err(Error::invalid(format!(
                "socks4a domain length {} out of range",
                domain.len()
            )));
        }
        let host = std::str::from_utf8(domain)
            .map_err(|_| Error::invalid("socks4a domain is not valid UTF-8"))?;
        TargetAddr::Domain(host.to_string(), port)
    } else {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    };

    Ok(Some((
        Request {
            command,
            target,
            user_id,
        },
        pos,
    )))
}

/// Encode a reply; the bound address is always reported as zero.
pub fn encode_reply(status: u8) -> [u8; 8] {
    [0x00, status, 0, 0, 0, 0, 0, 0]
}
