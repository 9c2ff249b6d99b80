//! Relay server
//!
//! Listens on a port and, for every accepted connection, opens a fresh
//! connection to the upstream and relays between the two. Either side may be
//! TLS: client connections can be terminated with a `TlsAcceptor`, upstream
//! connections can be wrapped with a `TlsConnector`.

use sockrelay_transport::{connect_tcp, tls, TcpTransport, Transport, TransportError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

use crate::reporter::{ErrorReporter, TracingReporter};
use crate::session::{RelaySession, DEFAULT_BUFFER_SIZE};

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("Upstream {address} unreachable: {reason}")]
    UpstreamError { address: SocketAddr, reason: String },

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("{step} did not finish within {timeout:?}")]
    SetupTimeout {
        step: &'static str,
        timeout: Duration,
    },

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// TLS settings for the upstream side
#[derive(Clone)]
pub struct UpstreamTls {
    pub connector: TlsConnector,
    /// Name presented in SNI and checked against the upstream certificate
    pub server_name: String,
}

#[derive(Clone)]
pub struct RelayServerConfig {
    pub bind_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub buffer_size: usize,
    /// Close sessions that relay nothing for this long
    pub idle_timeout: Option<Duration>,
    /// Terminate TLS from clients
    pub tls_acceptor: Option<TlsAcceptor>,
    pub upstream_tls: Option<UpstreamTls>,
}

impl RelayServerConfig {
    pub fn new(bind_addr: SocketAddr, upstream_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            upstream_addr,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
            tls_acceptor: None,
            upstream_tls: None,
        }
    }

    pub fn validate(&self) -> Result<(), RelayServerError> {
        if self.buffer_size == 0 {
            return Err(RelayServerError::ConfigError(
                "Buffer size must be > 0".to_string(),
            ));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(RelayServerError::ConfigError(
                "Idle timeout must be > 0".to_string(),
            ));
        }
        if let Some(upstream_tls) = &self.upstream_tls {
            if upstream_tls.server_name.is_empty() {
                return Err(RelayServerError::ConfigError(
                    "Upstream TLS server name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Session id generator for logging
#[derive(Clone)]
pub struct SessionIdGenerator {
    next_session_id: Arc<AtomicU32>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn generate(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RelayServer {
    config: Arc<RelayServerConfig>,
    session_ids: SessionIdGenerator,
    reporter: Arc<dyn ErrorReporter>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            session_ids: SessionIdGenerator::new(),
            reporter: Arc::new(TracingReporter),
        }
    }

    /// Route relay failures somewhere other than `tracing`
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    async fn bind_with_retry(&self) -> Result<TcpListener, RelayServerError> {
        let bind_addr = self.config.bind_addr;

        // Ports in TIME_WAIT free up quickly; retry up to 3 times, 1 second apart
        for attempt in 1..=3 {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/3",
                            bind_addr, attempt
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                        bind_addr.port(), attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(RelayServerError::BindError {
                        address: bind_addr.ip().to_string(),
                        port: bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(RelayServerError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Validate the configuration and bind the listener without serving yet
    pub async fn bind(self) -> Result<BoundRelayServer, RelayServerError> {
        self.config.validate()?;
        let listener = self.bind_with_retry().await?;
        Ok(BoundRelayServer {
            server: self,
            listener,
        })
    }

    /// Bind and serve until the task is dropped
    pub async fn start(self) -> Result<(), RelayServerError> {
        self.bind().await?.serve().await
    }

    async fn handle_connection(
        socket: TcpStream,
        peer_addr: SocketAddr,
        session_id: u32,
        config: Arc<RelayServerConfig>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<(), RelayServerError> {
        let client = within_setup_timeout(config.idle_timeout, "Client handshake", async {
            let client: Arc<dyn Transport> = match &config.tls_acceptor {
                Some(acceptor) => Arc::new(tls::accept(acceptor, socket).await?),
                None => Arc::new(TcpTransport::from_tcp(socket)?),
            };
            Ok::<_, RelayServerError>(client)
        })
        .await?;

        let upstream_addr = config.upstream_addr;
        let server = within_setup_timeout(config.idle_timeout, "Upstream connect", async {
            let upstream = match &config.upstream_tls {
                Some(upstream_tls) => {
                    tls::connect(&upstream_tls.connector, upstream_addr, &upstream_tls.server_name)
                        .await
                        .map(|t| Arc::new(t) as Arc<dyn Transport>)
                }
                None => connect_tcp(upstream_addr)
                    .await
                    .map(|t| Arc::new(t) as Arc<dyn Transport>),
            };
            upstream.map_err(|e| RelayServerError::UpstreamError {
                address: upstream_addr,
                reason: e.to_string(),
            })
        })
        .await?;

        debug!(
            "Session {}: relaying {} <-> {}",
            session_id, peer_addr, upstream_addr
        );

        let session = Arc::new(
            RelaySession::new(client, server)
                .with_id(session_id)
                .with_buffer_size(config.buffer_size)
                .with_reporter(reporter),
        );

        if let Some(idle_timeout) = config.idle_timeout {
            spawn_idle_watchdog(Arc::downgrade(&session), idle_timeout);
        }

        let summary = session.run().await;
        debug!(
            "Session {} closed: {} bytes client->server, {} bytes server->client in {} ms ({:?})",
            summary.session_id,
            summary.bytes_client_to_server,
            summary.bytes_server_to_client,
            summary.duration_ms,
            summary.cause
        );

        Ok(())
    }
}

/// Server with its listener bound
pub struct BoundRelayServer {
    server: RelayServer,
    listener: TcpListener,
}

impl BoundRelayServer {
    pub fn local_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), RelayServerError> {
        let addr = self.listener.local_addr()?;
        let server = self.server;
        info!(
            "Relay listening on {}, forwarding to {}",
            addr, server.config.upstream_addr
        );

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let session_id = server.session_ids.generate();
                    debug!("New connection from {} (session {})", peer_addr, session_id);

                    let config = server.config.clone();
                    let reporter = server.reporter.clone();

                    tokio::spawn(async move {
                        if let Err(e) = RelayServer::handle_connection(
                            socket, peer_addr, session_id, config, reporter,
                        )
                        .await
                        {
                            error!("Error handling connection from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Bound a connection setup step by the idle timeout, when one is set
async fn within_setup_timeout<T, F>(
    timeout: Option<Duration>,
    step: &'static str,
    setup: F,
) -> Result<T, RelayServerError>
where
    F: Future<Output = Result<T, RelayServerError>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, setup)
            .await
            .map_err(|_| RelayServerError::SetupTimeout { step, timeout })?,
        None => setup.await,
    }
}

/// Close `session` once it has relayed nothing for a full `idle_timeout`
fn spawn_idle_watchdog(weak: Weak<RelaySession>, idle_timeout: Duration) {
    tokio::spawn(async move {
        let mut last_total = match weak.upgrade() {
            Some(session) => session.stats().total_bytes(),
            None => return,
        };

        loop {
            tokio::time::sleep(idle_timeout).await;

            let Some(session) = weak.upgrade() else {
                break;
            };
            if session.is_closed() {
                break;
            }

            let total = session.stats().total_bytes();
            if total == last_total {
                info!(
                    "Session {} idle for {:?}, closing",
                    session.id(),
                    idle_timeout
                );
                session.close();
                break;
            }
            last_total = total;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayServerConfig {
        RelayServerConfig::new(
            "127.0.0.1:8080".parse().unwrap(),
            "127.0.0.1:5432".parse().unwrap(),
        )
    }

    #[test]
    fn test_relay_server_config() {
        let config = config();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.upstream_addr.port(), 5432);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.idle_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_buffer() {
        let mut config = config();
        config.buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(RelayServerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_config_rejects_zero_idle_timeout() {
        let mut config = config();
        config.idle_timeout = Some(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(RelayServerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_session_id_generator() {
        let gen = SessionIdGenerator::new();
        assert_eq!(gen.generate(), 1);
        assert_eq!(gen.generate(), 2);

        let shared = gen.clone();
        assert_eq!(shared.generate(), 3);
    }

    #[tokio::test]
    async fn test_setup_timeout() {
        let stalled = within_setup_timeout(
            Some(Duration::from_millis(20)),
            "Client handshake",
            std::future::pending::<Result<(), RelayServerError>>(),
        )
        .await;
        assert!(matches!(
            stalled,
            Err(RelayServerError::SetupTimeout {
                step: "Client handshake",
                ..
            })
        ));

        let quick = within_setup_timeout(None, "Upstream connect", async { Ok(5) }).await;
        assert_eq!(quick.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_bind_error_for_unassigned_address() {
        let mut config = config();
        // TEST-NET-3 is never assigned locally, so bind fails without retries
        config.bind_addr = "203.0.113.1:0".parse().unwrap();

        let result = RelayServer::new(config).bind().await;
        assert!(matches!(result, Err(RelayServerError::BindError { .. })));
    }
}
