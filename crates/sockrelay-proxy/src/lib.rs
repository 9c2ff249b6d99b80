//! Bidirectional socket relay
//!
//! Splices two connected transports so that bytes read from either side are
//! written verbatim to the other, until one side fails or goes away. The
//! [`RelaySession`] is the core; [`RelayServer`] accepts connections and pairs
//! each one with a fresh upstream connection.

mod classify;
mod reporter;
mod server;
mod session;

pub use classify::{classify, is_connection_terminated, ErrorKind};
pub use reporter::{ErrorReporter, TracingReporter};
pub use server::{
    BoundRelayServer, RelayServer, RelayServerConfig, RelayServerError, SessionIdGenerator,
    UpstreamTls,
};
pub use session::{
    Direction, RelayHandle, RelaySession, RelayStats, RelaySummary, DEFAULT_BUFFER_SIZE,
};
