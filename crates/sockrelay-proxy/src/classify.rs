//! Error classification for relay teardown
//!
//! Most errors that end a relay are the normal way a connection goes away.
//! Only the ones that are not get reported.

use sockrelay_transport::{Transport, TransportError};
use std::io;

/// What a terminal error means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Peer closed or reset the connection
    ConnectionTerminated,
    /// Our own `close()` cancelled the operation
    OperationAborted,
    /// TLS peer went away without `close_notify`
    TlsShortRead,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Only unexpected failures are worth surfacing
    pub fn is_reportable(self) -> bool {
        self == ErrorKind::Other
    }
}

/// Classify `error`, which was produced by an operation on `origin`.
///
/// TLS short-read detection is delegated to the transport, so backends
/// without TLS never produce [`ErrorKind::TlsShortRead`].
pub fn classify(error: &TransportError, origin: &dyn Transport) -> ErrorKind {
    if matches!(error, TransportError::Aborted) {
        return ErrorKind::OperationAborted;
    }
    // Checked before termination: rustls short reads surface as UnexpectedEof
    if origin.is_tls_short_read(error) {
        return ErrorKind::TlsShortRead;
    }
    if is_connection_terminated(error) {
        return ErrorKind::ConnectionTerminated;
    }
    ErrorKind::Other
}

/// Errors that mean the peer is gone
pub fn is_connection_terminated(error: &TransportError) -> bool {
    match error {
        TransportError::ConnectionClosed => true,
        TransportError::IoError(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
