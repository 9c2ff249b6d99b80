//! Transport trait for relay connections

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer finished the stream (read returned end-of-stream)
    #[error("Connection closed")]
    ConnectionClosed,

    /// The operation was cancelled by a local `close()`
    #[error("Operation aborted")]
    Aborted,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Duplex, closable byte transport
///
/// Implementations must allow one read and one write to be outstanding at the
/// same time (from different tasks), and `close` to be called concurrently
/// with both.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read at least one byte into `buf`.
    ///
    /// End-of-stream is reported as [`TransportError::ConnectionClosed`], so a
    /// successful read never returns `0` for a non-empty buffer.
    async fn read_some(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Write all of `data`, or fail.
    async fn write_all(&self, data: &[u8]) -> TransportResult<()>;

    /// Close the transport.
    ///
    /// Idempotent and non-blocking. Pending and future reads/writes complete
    /// with [`TransportError::Aborted`].
    fn close(&self);

    /// Check if the transport has been closed locally
    fn is_closed(&self) -> bool;

    /// Whether `error` is the TLS layer reporting a peer that went away
    /// without sending `close_notify`.
    ///
    /// Backends without TLS never match.
    fn is_tls_short_read(&self, _error: &TransportError) -> bool {
        false
    }

    /// Remote address, when the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
