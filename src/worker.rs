//! Start/stop orchestration for the two roles.
//!
//! A [`Worker`] runs the local SOCKS5 listener; a [`ServerWorker`] runs the
//! tunnel endpoint. Both own a config snapshot and a resolver, build their
//! protocol factory on `start`, and hand it to a fresh [`ContentServer`].
//! A failed start leaves the worker stopped and may be retried.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{Resolver, SocketPolicy, SystemResolver, TlsServer};
use crate::proxy::{ShadowsocksFactory, Socks5Factory};
use crate::server::{ConnectionFactory, ContentServer, ContentServerOptions, MetricsSnapshot};

struct Running {
    server: ContentServer,
    local_addr: SocketAddr,
}

#[derive(Default)]
struct SlotState {
    running: Option<Running>,
    starting: bool,
    /// `stop` ran while a start was in flight
    stop_requested: bool,
}

/// Running acceptor slot shared by both worker kinds.
#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    async fn start(
        &self,
        factory: Arc<dyn ConnectionFactory>,
        options: ContentServerOptions,
        resolver: &dyn Resolver,
        host: &str,
        port: u16,
        backlog: u32,
    ) -> Result<SocketAddr> {
        {
            let mut state = self.state.lock();
            if state.starting || state.running.is_some() {
                return Err(Error::config("worker is already running"));
            }
            state.starting = true;
            state.stop_requested = false;
        }

        let launched = Self::launch(factory, options, resolver, host, port, backlog).await;
        let (outcome, cancelled) = {
            let mut state = self.state.lock();
            state.starting = false;
            let stop_requested = std::mem::take(&mut state.stop_requested);
            match launched {
                Ok(running) if stop_requested => (Err(Error::Closed), Some(running)),
                Ok(running) => {
                    let addr = running.local_addr;
                    state.running = Some(running);
                    (Ok(addr), None)
                }
                Err(e) => (Err(e), None),
            }
        };

        if let Some(running) = cancelled {
            running.server.stop().await;
            tracing::info!("stopped during start, listener on {} closed", running.local_addr);
        }
        outcome
    }

    async fn launch(
        factory: Arc<dyn ConnectionFactory>,
        options: ContentServerOptions,
        resolver: &dyn Resolver,
        host: &str,
        port: u16,
        backlog: u32,
    ) -> Result<Running> {
        let addr = resolver
            .resolve(host, port)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Resolve(format!("{}: no addresses", host)))?;

        let server = ContentServer::new(factory, options);
        let local_addr = match server.listen(addr, backlog).await {
            Ok(bound) => bound,
            Err(e) => {
                server.stop().await;
                return Err(e);
            }
        };
        Ok(Running { server, local_addr })
    }

    async fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            if state.starting {
                state.stop_requested = true;
            }
            state.running.take()
        };
        if let Some(running) = running {
            running.server.stop().await;
            tracing::info!("listener on {} stopped", running.local_addr);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().running.as_ref().map(|r| r.local_addr)
    }

    fn current_connections(&self) -> usize {
        self.state
            .lock()
            .running
            .as_ref()
            .map_or(0, |r| r.server.current_connections())
    }

    fn metrics(&self) -> Option<MetricsSnapshot> {
        self.state
            .lock()
            .running
            .as_ref()
            .map(|r| r.server.metrics().snapshot())
    }

    fn metrics_report(&self) -> Option<String> {
        self.state
            .lock()
            .running
            .as_ref()
            .map(|r| r.server.metrics().format_report())
    }
}

fn server_options(config: &Config, tls: Option<TlsServer>) -> ContentServerOptions {
    ContentServerOptions {
        max_listens: config.max_listens,
        handshake_timeout: config.connect_timeout(),
        socket_policy: SocketPolicy::new(config.socket.clone()),
        tls,
    }
}

/// Local role: SOCKS5 listener on `local_host:local_port`.
pub struct Worker {
    config: Config,
    resolver: Arc<dyn Resolver>,
    slot: Slot,
}

impl Worker {
    /// Create a stopped worker.
    pub fn new(config: Config, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            config,
            resolver,
            slot: Slot::default(),
        }
    }

    /// Create a stopped worker using the system resolver.
    pub fn with_system_resolver(config: Config) -> Self {
        Self::new(config, Arc::new(SystemResolver))
    }

    /// Configuration snapshot.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate the configuration and start listening.
    ///
    /// Returns the bound address. On failure nothing is left running.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.config.validate()?;
        let factory = Socks5Factory::from_config(&self.config, Arc::clone(&self.resolver))?;
        tracing::info!(
            mode = ?self.config.local_mode,
            method = %self.config.method,
            "starting local proxy, upstream {}",
            self.config.server_addr()
        );

        self.slot
            .start(
                Arc::new(factory),
                server_options(&self.config, None),
                self.resolver.as_ref(),
                &self.config.local_host,
                self.config.local_port,
                self.config.backlog,
            )
            .await
    }

    /// Stop listening and close every connection. Idempotent.
    pub async fn stop(&self) {
        self.slot.stop().await;
    }

    /// Whether the listener is up.
    pub fn is_running(&self) -> bool {
        self.slot.local_addr().is_some()
    }

    /// Bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.local_addr()
    }

    /// Bound listen port while running.
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Live client connections (zero when stopped).
    pub fn current_connections(&self) -> usize {
        self.slot.current_connections()
    }

    /// Acceptor metrics while running.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.slot.metrics()
    }

    /// Human-readable metrics report while running.
    pub fn metrics_report(&self) -> Option<String> {
        self.slot.metrics_report()
    }
}

/// Server role: tunnel endpoint on `server_host:server_port`.
pub struct ServerWorker {
    config: Config,
    resolver: Arc<dyn Resolver>,
    slot: Slot,
}

impl ServerWorker {
    /// Create a stopped server worker.
    pub fn new(config: Config, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            config,
            resolver,
            slot: Slot::default(),
        }
    }

    /// Create a stopped server worker using the system resolver.
    pub fn with_system_resolver(config: Config) -> Self {
        Self::new(config, Arc::new(SystemResolver))
    }

    /// Configuration snapshot.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate the configuration, load the TLS identity if enabled, and
    /// start listening.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.config.validate_server()?;
        let tls = if self.config.tls.enabled {
            Some(TlsServer::from_options(&self.config.tls)?)
        } else {
            None
        };
        let factory = ShadowsocksFactory::from_config(&self.config, Arc::clone(&self.resolver))?;
        tracing::info!(
            method = %self.config.method,
            tls = self.config.tls.enabled,
            padding = self.config.padding_support,
            "starting tunnel server"
        );

        self.slot
            .start(
                Arc::new(factory),
                server_options(&self.config, tls),
                self.resolver.as_ref(),
                &self.config.server_host,
                self.config.server_port,
                self.config.backlog,
            )
            .await
    }

    /// Stop listening and close every connection. Idempotent.
    pub async fn stop(&self) {
        self.slot.stop().await;
    }

    /// Whether the listener is up.
    pub fn is_running(&self) -> bool {
        self.slot.local_addr().is_some()
    }

    /// Bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.local_addr()
    }

    /// Bound listen port while running.
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Live tunnel connections (zero when stopped).
    pub fn current_connections(&self) -> usize {
        self.slot.current_connections()
    }

    /// Acceptor metrics while running.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.slot.metrics()
    }

    /// Human-readable metrics report while running.
    pub fn metrics_report(&self) -> Option<String> {
        self.slot.metrics_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalMode;

    fn local_config() -> Config {
        Config {
            local_port: 0,
            password: "worker-test".into(),
            local_mode: LocalMode::Direct,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_start_reports_bound_port() {
        let worker = Worker::with_system_resolver(local_config());
        assert!(!worker.is_running());
        assert_eq!(worker.local_port(), None);

        let addr = worker.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(worker.local_port(), Some(addr.port()));
        assert_eq!(worker.current_connections(), 0);
        assert_eq!(worker.metrics().unwrap().listens, 1);
        assert!(worker.metrics_report().unwrap().contains("Listening sockets: 1"));

        worker.stop().await;
        assert!(!worker.is_running());
        assert!(worker.metrics().is_none());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let worker = Worker::with_system_resolver(local_config());
        worker.start().await.unwrap();
        assert!(worker.start().await.is_err());
        assert!(worker.is_running());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let worker = Worker::with_system_resolver(local_config());
        worker.stop().await;
        worker.start().await.unwrap();
        worker.stop().await;
        worker.stop().await;
        // Restart after stop.
        worker.start().await.unwrap();
        worker.stop().await;
    }

    /// Resolves literals, but only once released.
    struct GatedResolver {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl Resolver for GatedResolver {
        async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
            self.entered.notify_one();
            self.release.notified().await;
            let ip: std::net::IpAddr = host
                .parse()
                .map_err(|_| Error::Resolve(host.to_string()))?;
            Ok(vec![SocketAddr::new(ip, port)])
        }
    }

    #[tokio::test]
    async fn test_stop_during_start_wins() {
        let resolver = Arc::new(GatedResolver {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let worker = Worker::new(local_config(), Arc::clone(&resolver) as Arc<dyn Resolver>);

        let (started, ()) = tokio::join!(worker.start(), async {
            resolver.entered.notified().await;
            worker.stop().await;
            resolver.release.notify_one();
        });

        assert!(matches!(started, Err(Error::Closed)));
        assert!(!worker.is_running());
        assert_eq!(worker.current_connections(), 0);

        // The stop request does not leak into the next start.
        let next = tokio::spawn({
            let resolver = Arc::clone(&resolver);
            async move {
                resolver.entered.notified().await;
                resolver.release.notify_one();
            }
        });
        worker.start().await.unwrap();
        next.await.unwrap();
        assert!(worker.is_running());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_worker_stopped() {
        let config = Config {
            password: String::new(),
            ..local_config()
        };
        let worker = Worker::with_system_resolver(config);
        let err = worker.start().await.unwrap_err();
        assert!(err.to_string().contains("password"));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_worker_stopped() {
        let first = Worker::with_system_resolver(local_config());
        let addr = first.start().await.unwrap();

        let taken = Config {
            local_port: addr.port(),
            ..local_config()
        };
        let second = Worker::with_system_resolver(taken);
        assert!(second.start().await.is_err());
        assert!(!second.is_running());
        first.stop().await;
    }

    #[tokio::test]
    async fn test_server_worker_requires_tls_identity() {
        let mut config = Config {
            server_port: 0,
            password: "worker-test".into(),
            ..Config::default()
        };
        config.tls.enabled = true;
        let worker = ServerWorker::with_system_resolver(config);
        assert!(worker.start().await.is_err());
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_server_worker_start_stop() {
        let config = Config {
            server_port: 0,
            password: "worker-test".into(),
            ..Config::default()
        };
        let worker = ServerWorker::with_system_resolver(config);
        let addr = worker.start().await.unwrap();
        assert_eq!(worker.local_port(), Some(addr.port()));
        worker.stop().await;
        assert_eq!(worker.current_connections(), 0);
    }
}
