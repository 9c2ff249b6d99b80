//! Transport abstraction for relay sessions
//!
//! A transport is a duplex, asynchronous, closable byte connection. The relay
//! core only needs three things from it: read some bytes, write a buffer in
//! full, and close (cancelling whatever is still pending).

pub mod stream;
#[cfg(feature = "tls")]
pub mod tls;
pub mod transport;

pub use stream::{connect_tcp, Backend, StreamTransport, TcpTransport};
pub use transport::{Transport, TransportError, TransportResult};
