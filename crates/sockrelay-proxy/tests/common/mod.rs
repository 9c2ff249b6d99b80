//! Shared fixtures for relay tests

#![allow(dead_code)]

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sockrelay_proxy::ErrorReporter;
use sockrelay_transport::{Transport, TransportError, TransportResult};
use std::net::SocketAddr;
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub transport: &'static str,
    pub op: Op,
    pub bytes: usize,
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// Transport driven by the test: reads return whatever was fed, writes are
/// captured, and every completed operation is appended to a shared log.
pub struct ScriptedTransport {
    name: &'static str,
    tls: bool,
    feed_tx: mpsc::UnboundedSender<TransportResult<Vec<u8>>>,
    feed_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportResult<Vec<u8>>>>,
    written: Mutex<Vec<u8>>,
    write_error: Mutex<Option<TransportError>>,
    shutdown: CancellationToken,
    close_calls: AtomicUsize,
    log: EventLog,
}

impl ScriptedTransport {
    pub fn new(name: &'static str, log: EventLog) -> Arc<Self> {
        Self::build(name, false, log)
    }

    pub fn tls(name: &'static str, log: EventLog) -> Arc<Self> {
        Self::build(name, true, log)
    }

    fn build(name: &'static str, tls: bool, log: EventLog) -> Arc<Self> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name,
            tls,
            feed_tx,
            feed_rx: tokio::sync::Mutex::new(feed_rx),
            written: Mutex::new(Vec::new()),
            write_error: Mutex::new(None),
            shutdown: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
            log,
        })
    }

    /// Make the next read return `data`
    pub fn feed(&self, data: &[u8]) {
        let _ = self.feed_tx.send(Ok(data.to_vec()));
    }

    /// Make the next read fail
    pub fn fail_read(&self, error: TransportError) {
        let _ = self.feed_tx.send(Err(error));
    }

    /// Make the next write fail
    pub fn fail_next_write(&self, error: TransportError) {
        *self.write_error.lock().unwrap() = Some(error);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn record(&self, op: Op, bytes: usize) {
        self.log.lock().unwrap().push(Event {
            transport: self.name,
            op,
            bytes,
        });
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn read_some(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Aborted);
        }

        let next = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::Aborted),
            next = async { self.feed_rx.lock().await.recv().await } => next,
        };

        match next {
            Some(Ok(data)) => {
                assert!(data.len() <= buf.len(), "fed chunk larger than buffer");
                buf[..data.len()].copy_from_slice(&data);
                self.record(Op::Read, data.len());
                Ok(data.len())
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn write_all(&self, data: &[u8]) -> TransportResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        if let Some(error) = self.write_error.lock().unwrap().take() {
            return Err(error);
        }
        self.written.lock().unwrap().extend_from_slice(data);
        self.record(Op::Write, data.len());
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn is_tls_short_read(&self, error: &TransportError) -> bool {
        self.tls
            && matches!(error, TransportError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Reporter that keeps every report for inspection
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, &'static Location<'static>)>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<(String, &'static Location<'static>)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &TransportError, location: &'static Location<'static>) {
        self.reports.lock().unwrap().push((error.to_string(), location));
    }
}

pub fn io_error(kind: std::io::ErrorKind) -> TransportError {
    TransportError::IoError(std::io::Error::new(kind, "injected"))
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Plain TCP echo server on a random port
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// TLS echo server on a random port, using a fresh self-signed certificate
pub async fn spawn_tls_echo_server() -> SocketAddr {
    let acceptor = self_signed_acceptor();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(socket).await else {
                    return;
                };
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            if stream.flush().await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

pub fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    (vec![cert.der().clone()], PrivateKeyDer::Pkcs8(key))
}

pub fn self_signed_acceptor() -> TlsAcceptor {
    let (certs, key) = self_signed();
    sockrelay_transport::tls::acceptor_from_der(certs, key).unwrap()
}

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}
