//! sockrelay - relay TCP/TLS connections to an upstream
//!
//! Every accepted connection is paired with a new upstream connection and
//! bytes are copied both ways until either side goes away.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sockrelay_proxy::{RelayServer, RelayServerConfig, UpstreamTls, DEFAULT_BUFFER_SIZE};
use sockrelay_transport::tls;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// sockrelay - splice client connections onto an upstream service
#[derive(Parser, Debug)]
#[command(name = "sockrelay")]
#[command(version)]
#[command(long_about = r#"
Listen for connections and relay each one, byte for byte, to an upstream
address. Client connections can be TLS-terminated and the upstream can be
reached over TLS.

EXAMPLES:
  # Forward local port 5433 to PostgreSQL
  sockrelay --listen 0.0.0.0:5433 --upstream 10.0.0.5:5432

  # Terminate TLS from clients, talk plain TCP to the backend
  sockrelay --listen 0.0.0.0:443 --upstream 127.0.0.1:8080 \
    --tls-cert cert.pem --tls-key key.pem

The upstream hostname is resolved once, when sockrelay starts. Restart it
to pick up DNS changes.

ENVIRONMENT VARIABLES:
  SOCKRELAY_LISTEN    Address to listen on
  SOCKRELAY_UPSTREAM  Address to relay to
  RUST_LOG            Log filter (overrides --verbose)
"#)]
struct Cli {
    /// Address to listen on (e.g., 0.0.0.0:5433)
    #[arg(long, env = "SOCKRELAY_LISTEN")]
    listen: SocketAddr,

    /// Upstream address (host:port); a hostname is resolved once at startup,
    /// so DNS changes need a restart
    #[arg(long, env = "SOCKRELAY_UPSTREAM")]
    upstream: String,

    /// Per-direction buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Close sessions that relay nothing for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// PEM certificate chain for terminating client TLS
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for terminating client TLS
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Connect to the upstream over TLS
    #[arg(long)]
    upstream_tls: bool,

    /// Server name for upstream TLS (defaults to the upstream host)
    #[arg(long, requires = "upstream_tls")]
    upstream_server_name: Option<String>,

    /// Skip upstream certificate verification (insecure, for development only)
    #[arg(long, requires = "upstream_tls")]
    insecure: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging; RUST_LOG wins over the verbosity flag
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Host part of `host:port`, without IPv6 brackets
fn upstream_host(upstream: &str) -> &str {
    let host = upstream
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(upstream);
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn build_config(cli: &Cli) -> Result<RelayServerConfig> {
    if cli.buffer_size == 0 {
        bail!("--buffer-size must be greater than 0");
    }

    let upstream_addr = tokio::net::lookup_host(&cli.upstream)
        .await
        .with_context(|| format!("Failed to resolve upstream {}", cli.upstream))?
        .next()
        .with_context(|| format!("Upstream {} resolved to no addresses", cli.upstream))?;

    let mut config = RelayServerConfig::new(cli.listen, upstream_addr);
    config.buffer_size = cli.buffer_size;
    config.idle_timeout = cli.idle_timeout.map(Duration::from_secs);

    if let (Some(cert), Some(key)) = (&cli.tls_cert, &cli.tls_key) {
        let acceptor = tls::acceptor_from_pem_files(cert, key)
            .context("Failed to load TLS certificate/key")?;
        config.tls_acceptor = Some(acceptor);
    }

    if cli.upstream_tls {
        let server_name = cli
            .upstream_server_name
            .clone()
            .unwrap_or_else(|| upstream_host(&cli.upstream).to_string());
        let connector = tls::connector(Vec::new(), cli.insecure)
            .context("Failed to build upstream TLS connector")?;
        config.upstream_tls = Some(UpstreamTls {
            connector,
            server_name,
        });
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = build_config(&cli).await?;
    info!(
        "sockrelay starting: {} -> {} (client TLS: {}, upstream TLS: {})",
        config.bind_addr,
        config.upstream_addr,
        config.tls_acceptor.is_some(),
        config.upstream_tls.is_some()
    );

    RelayServer::new(config)
        .start()
        .await
        .context("Relay server failed")?;

    Ok(())
}
