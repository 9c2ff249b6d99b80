//! Sink for relay failures worth surfacing

use sockrelay_transport::TransportError;
use std::panic::Location;
use tracing::error;

/// Receives errors classified as [`ErrorKind::Other`](crate::ErrorKind::Other)
pub trait ErrorReporter: Send + Sync {
    /// `location` is where in the relay the failing completion was handled
    fn report(&self, error: &TransportError, location: &'static Location<'static>);
}

/// Reports through `tracing` at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &TransportError, location: &'static Location<'static>) {
        error!(
            file = location.file(),
            line = location.line(),
            "Relay failed: {}",
            error
        );
    }
}
