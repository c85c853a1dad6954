//! HTTP proxy requests on the local listener.
//!
//! `CONNECT host:port` opens a tunnel and is answered with
//! `200 Connection established` once the upstream is up. Any other method
//! is forwarded: the request head is rewritten to origin form, with the
//! target taken from `Host` (or the absolute URI when `Host` is missing),
//! and sent upstream ahead of the body. Only the first request head of a
//! connection is rewritten; later ones pass through untouched.

use std::net::{IpAddr, SocketAddr};

use super::address::TargetAddr;
use crate::error::{Error, Result};

/// Reply to a successful `CONNECT`.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Malformed or unsupported request.
pub const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

/// Upstream could not be reached.
pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

/// Upstream did not answer in time.
pub const RESPONSE_504: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const MAX_HEADERS: usize = 64;
const DEFAULT_PORT: u16 = 80;
const MAX_HOST_LEN: usize = 255;

/// A parsed proxy request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method as sent
    pub method: String,
    /// Destination
    pub target: TargetAddr,
    /// Rewritten head to send upstream; empty for `CONNECT`
    pub forward_head: Vec<u8>,
}

impl Request {
    /// Whether this is a `CONNECT` tunnel request.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Whether `byte` can start an HTTP method.
pub fn is_method_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic()
}

/// Response sent when a request fails before streaming starts.
pub fn error_response(err: &Error) -> &'static [u8] {
    match err {
        Error::Timeout(_) => RESPONSE_504,
        Error::InvalidMessage(_)
        | Error::Handshake(_)
        | Error::UnsupportedCommand(_)
        | Error::UnsupportedAddressType(_) => RESPONSE_400,
        _ => RESPONSE_502,
    }
}

/// Split `host[:port]` or `[v6][:port]` into a target.
pub fn parse_authority(authority: &str, default_port: u16) -> Result<TargetAddr> {
    let bad = || Error::invalid(format!("bad authority {:?}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        let port = match &rest[end + 1..] {
            "" => None,
            tail => Some(tail.strip_prefix(':').ok_or_else(bad)?),
        };
        (&rest[..end], port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| bad())?,
        None => default_port,
    };
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return Err(bad());
    }

    Ok(match host.parse::<IpAddr>() {
        Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
        Err(_) => TargetAddr::Domain(host.to_string(), port),
    })
}

/// Split an absolute URI into its authority and origin-form path.
/// Origin-form input is returned unchanged with no authority.
fn split_uri(uri: &str) -> (Option<&str>, String) {
    let Some(scheme_end) = uri.find("://") else {
        return (None, uri.to_string());
    };
    let rest = &uri[scheme_end + 3..];
    let split = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(split);
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let path = if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('?') {
        format!("/{}", path)
    } else {
        path.to_string()
    };
    (Some(authority), path)
}

/// Parse a request head from the front of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let used = match req.parse(buf) {
        Ok(httparse::Status::Complete(used)) => used,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::invalid(format!("HTTP request: {}", e))),
    };
    let method = req.method.unwrap_or("");
    let path = req.path.unwrap_or("");

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = parse_authority(path, DEFAULT_PORT)?;
        return Ok(Some((
            Request {
                method: method.to_string(),
                target,
                forward_head: Vec::new(),
            },
            used,
        )));
    }

    let (uri_authority, origin_path) = split_uri(path);
    let host_header = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| std::str::from_utf8(h.value))
        .transpose()
        .map_err(|_| Error::invalid("Host header is not valid UTF-8"))?;
    let authority = host_header
        .or(uri_authority)
        .ok_or_else(|| Error::invalid("request has no Host"))?;
    let target = parse_authority(authority.trim(), DEFAULT_PORT)?;

    let mut head = Vec::with_capacity(used);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, origin_path).as_bytes());
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        head.extend_from_slice(header.name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(header.value);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    Ok(Some((
        Request {
            method: method.to_string(),
            target,
            forward_head: head,
        },
        used,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nhello";
        let (request, used) = parse_request(buf).unwrap().unwrap();
        assert!(request.is_connect());
        assert_eq!(request.target, TargetAddr::Domain("example.com".into(), 443));
        assert!(request.forward_head.is_empty());
        assert_eq!(&buf[used..], b"hello");
    }

    #[test]
    fn test_partial_head() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: exa";
        assert!(parse_request(buf).unwrap().is_none());
    }

    #[test]
    fn test_forward_rewrites_absolute_uri() {
        let buf = b"GET http://example.com:8080/a/b?q=1 HTTP/1.1\r\n\
Host: example.com:8080\r\n\
Proxy-Connection: keep-alive\r\n\
Accept: */*\r\n\r\n";
        let (request, used) = parse_request(buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert!(!request.is_connect());
        assert_eq!(request.target, TargetAddr::Domain("example.com".into(), 8080));
        assert_eq!(
            request.forward_head,
            b"GET /a/b?q=1 HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_forward_without_host_uses_uri() {
        let buf = b"GET http://10.0.0.1 HTTP/1.1\r\n\r\n";
        let (request, _) = parse_request(buf).unwrap().unwrap();
        assert_eq!(request.target, TargetAddr::Ip("10.0.0.1:80".parse().unwrap()));
        assert_eq!(request.forward_head, b"GET / HTTP/1.1\r\n\r\n".to_vec());

        // Origin form with no Host has nowhere to go.
        assert!(parse_request(b"GET /index.html HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("[::1]:8443", 80).unwrap(),
            TargetAddr::Ip("[::1]:8443".parse().unwrap())
        );
        assert_eq!(
            parse_authority("[::1]", 80).unwrap(),
            TargetAddr::Ip("[::1]:80".parse().unwrap())
        );
        assert_eq!(
            parse_authority("example.org", 80).unwrap(),
            TargetAddr::Domain("example.org".into(), 80)
        );
        assert!(parse_authority("example.org:http", 80).is_err());
        assert!(parse_authority(":443", 80).is_err());
        assert!(parse_authority("[::1", 80).is_err());
    }

    #[test]
    fn test_malformed_and_error_mapping() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").is_err());
        assert_eq!(error_response(&Error::invalid("x")), RESPONSE_400);
        assert_eq!(error_response(&Error::Timeout(10)), RESPONSE_504);
        assert_eq!(error_response(&Error::Resolve("x".into())), RESPONSE_502);
    }
}
