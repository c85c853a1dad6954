//! Platform socket tuning, applied best-effort.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::config::SocketOptions;

/// Socket options applied to every accepted and dialed TCP socket.
///
/// Failures are logged and never fail the connection.
#[derive(Debug, Clone, Default)]
pub struct SocketPolicy {
    options: SocketOptions,
}

impl SocketPolicy {
    /// Build a policy from configuration.
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }

    /// Options this policy applies.
    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Apply every configured option to `stream`.
    pub fn apply(&self, stream: &TcpStream) {
        if self.options.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(error = %e, "failed to set TCP_NODELAY");
            }
        }

        let sock = SockRef::from(stream);

        if let Some(secs) = self.options.tcp_keepalive_secs {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(secs))
                .with_interval(Duration::from_secs(secs.clamp(1, 20)));

            #[cfg(target_os = "linux")]
            let keepalive = keepalive.with_retries(3);

            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                tracing::warn!(error = %e, "failed to set TCP keepalive");
            }
        }

        if let Some(size) = self.options.send_buffer {
            if let Err(e) = sock.set_send_buffer_size(size) {
                tracing::warn!(error = %e, size, "failed to set SO_SNDBUF");
            }
        }

        if let Some(size) = self.options.recv_buffer {
            if let Err(e) = sock.set_recv_buffer_size(size) {
                tracing::warn!(error = %e, size, "failed to set SO_RCVBUF");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_apply_sets_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let policy = SocketPolicy::new(SocketOptions {
            tcp_nodelay: true,
            tcp_keepalive_secs: Some(30),
            send_buffer: Some(64 * 1024),
            recv_buffer: Some(64 * 1024),
        });
        policy.apply(&stream);

        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_apply_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

        let policy = SocketPolicy::new(SocketOptions {
            tcp_nodelay: false,
            tcp_keepalive_secs: None,
            send_buffer: None,
            recv_buffer: None,
        });
        policy.apply(&stream);
        assert!(!stream.nodelay().unwrap());
    }
}
