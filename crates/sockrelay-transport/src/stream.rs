//! Transport over any tokio byte stream
//!
//! The stream is split into a read half and a write half so that the two
//! relay directions never contend for the same lock. Closing cancels a shared
//! token which every pending operation races against, then drops both halves
//! so the peer sees the disconnect while the transport is still referenced.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{Transport, TransportError, TransportResult};

/// Which protocol stack sits under the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Raw bytes (TCP, in-memory pipes)
    Plain,
    /// rustls session on top of TCP
    Tls,
}

/// [`Transport`] implementation for a tokio `AsyncRead + AsyncWrite` stream
pub struct StreamTransport<T> {
    reader: Arc<Mutex<Option<ReadHalf<T>>>>,
    writer: Arc<Mutex<Option<WriteHalf<T>>>>,
    shutdown: CancellationToken,
    backend: Backend,
    peer_addr: Option<SocketAddr>,
}

pub type TcpTransport = StreamTransport<TcpStream>;

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: T, backend: Backend) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Arc::new(Mutex::new(Some(reader))),
            writer: Arc::new(Mutex::new(Some(writer))),
            shutdown: CancellationToken::new(),
            backend,
            peer_addr: None,
        }
    }

    /// Wrap a stream that carries raw bytes
    pub fn plain(stream: T) -> Self {
        Self::new(stream, Backend::Plain)
    }

    /// Record the remote address for logging
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl TcpTransport {
    /// Wrap an accepted or connected TCP socket
    pub fn from_tcp(stream: TcpStream) -> TransportResult<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self::plain(stream).with_peer_addr(peer_addr))
    }
}

/// Open a TCP connection and wrap it as a transport
pub async fn connect_tcp(addr: SocketAddr) -> TransportResult<TcpTransport> {
    let stream = TcpStream::connect(addr).await?;
    debug!("Connected to {}", addr);
    TcpTransport::from_tcp(stream)
}

#[async_trait]
impl<T> Transport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_some(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Aborted);
        }

        let n = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::Aborted),
            result = async {
                let mut reader = self.reader.lock().await;
                match reader.as_mut() {
                    Some(reader) => reader.read(buf).await.map_err(TransportError::from),
                    None => Err(TransportError::Aborted),
                }
            } => result?,
        };

        if n == 0 && !buf.is_empty() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn write_all(&self, data: &[u8]) -> TransportResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Aborted);
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Aborted),
            result = async {
                let mut writer = self.writer.lock().await;
                let Some(writer) = writer.as_mut() else {
                    return Err(TransportError::Aborted);
                };
                writer.write_all(data).await?;
                // TLS buffers records internally
                writer.flush().await?;
                Ok(())
            } => result,
        }
    }

    fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing {:?} transport (peer {:?})", self.backend, self.peer_addr);
            self.shutdown.cancel();
            self.release_stream();
        }
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn is_tls_short_read(&self, error: &TransportError) -> bool {
        self.backend == Backend::Tls && is_unexpected_eof(error)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Drop both halves, closing the underlying socket. A half still held by
    /// an operation unwinding from cancellation is released from a task once
    /// its lock frees up.
    fn release_stream(&self) {
        if let (Ok(mut reader), Ok(mut writer)) = (self.reader.try_lock(), self.writer.try_lock()) {
            reader.take();
            writer.take();
            return;
        }

        let reader = Arc::clone(&self.reader);
        let writer = Arc::clone(&self.writer);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    reader.lock().await.take();
                    writer.lock().await.take();
                });
            }
            Err(_) => debug!("No runtime to release the stream; it closes on drop"),
        }
    }
}

/// rustls reports a peer that closed the socket without `close_notify` as an
/// `UnexpectedEof` read error.
fn is_unexpected_eof(error: &TransportError) -> bool {
    matches!(error, TransportError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}
