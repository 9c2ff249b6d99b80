//! Relay session
//!
//! A session owns one client transport and one server transport and runs two
//! pump tasks, client→server and server→client. Each task loops strictly
//! read → write → read with its own buffer and holds an `Arc` to the session
//! for its whole lifetime, so the session outlives every operation it issued.
//!
//! All completion handling goes through one mutex guarding the shutdown
//! state. The first terminal condition in either direction closes both
//! transports; pending operations on them then complete as aborted and the
//! other task exits without acting on them.

use chrono::{DateTime, Utc};
use sockrelay_transport::{Transport, TransportError, TransportResult};
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::classify::{classify, ErrorKind};
use crate::reporter::{ErrorReporter, TracingReporter};

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// One of the two pump loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Byte counters for a session
pub struct RelayStats {
    client_to_server: AtomicU64,
    server_to_client: AtomicU64,
    started_at: DateTime<Utc>,
}

impl RelayStats {
    fn new() -> Self {
        Self {
            client_to_server: AtomicU64::new(0),
            server_to_client: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    fn record(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn client_to_server(&self) -> u64 {
        self.client_to_server.load(Ordering::Relaxed)
    }

    pub fn server_to_client(&self) -> u64 {
        self.server_to_client.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.client_to_server() + self.server_to_client()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Final accounting for a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub session_id: u32,
    pub bytes_client_to_server: u64,
    pub bytes_server_to_client: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// Classification of the first terminal error, `None` if the session was
    /// closed from outside
    pub cause: Option<ErrorKind>,
}

#[derive(Debug, Default)]
struct ShutdownState {
    closed: bool,
    cause: Option<ErrorKind>,
}

pub struct RelaySession {
    id: u32,
    client: Arc<dyn Transport>,
    server: Arc<dyn Transport>,
    buffer_size: usize,
    reporter: Arc<dyn ErrorReporter>,
    shutdown: Mutex<ShutdownState>,
    stats: RelayStats,
}

impl RelaySession {
    pub fn new(client: Arc<dyn Transport>, server: Arc<dyn Transport>) -> Self {
        Self {
            id: 0,
            client,
            server,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reporter: Arc::new(TracingReporter),
            shutdown: Mutex::new(ShutdownState::default()),
            stats: RelayStats::new(),
        }
    }

    /// Set the id used in log messages and the summary
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Capacity of each direction's buffer (clamped to at least one byte)
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Start both pump loops
    pub fn start(self: &Arc<Self>) -> RelayHandle {
        debug!(
            "Relay session {} started (client {:?}, server {:?})",
            self.id,
            self.client.peer_addr(),
            self.server.peer_addr()
        );
        RelayHandle {
            client_to_server: self.start_client_to_server(),
            server_to_client: self.start_server_to_client(),
            session: self.clone(),
        }
    }

    /// Start both pump loops and wait until the session is over
    pub async fn run(self: Arc<Self>) -> RelaySummary {
        self.start().join().await
    }

    pub fn start_client_to_server(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().pump(Direction::ClientToServer))
    }

    pub fn start_server_to_client(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().pump(Direction::ServerToClient))
    }

    /// Close both transports. Only the first call has any effect.
    pub fn close(&self) {
        let mut state = self.lock_shutdown();
        self.close_locked(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        self.lock_shutdown().closed
    }

    pub fn summary(&self) -> RelaySummary {
        let cause = self.lock_shutdown().cause;
        let started_at = self.stats.started_at();
        RelaySummary {
            session_id: self.id,
            bytes_client_to_server: self.stats.client_to_server(),
            bytes_server_to_client: self.stats.server_to_client(),
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
            cause,
        }
    }

    fn endpoints(&self, direction: Direction) -> (&dyn Transport, &dyn Transport) {
        match direction {
            Direction::ClientToServer => (self.client.as_ref(), self.server.as_ref()),
            Direction::ServerToClient => (self.server.as_ref(), self.client.as_ref()),
        }
    }

    async fn pump(self: Arc<Self>, direction: Direction) {
        let (source, destination) = self.endpoints(direction);
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let read = source.read_some(&mut buffer).await;
            let Some(n) = self.on_read_complete(direction, read) else {
                break;
            };

            let written = destination.write_all(&buffer[..n]).await;
            if !self.on_write_complete(direction, n, written) {
                break;
            }
        }

        debug!("Relay session {} {} stopped", self.id, direction);
    }

    /// Returns the number of bytes to forward, or `None` when the direction
    /// is done.
    #[track_caller]
    fn on_read_complete(
        &self,
        direction: Direction,
        read: TransportResult<usize>,
    ) -> Option<usize> {
        let location = Location::caller();
        let mut state = self.lock_shutdown();

        match read {
            Ok(n) if !state.closed => {
                trace!("Session {} {} read {} bytes", self.id, direction, n);
                Some(n)
            }
            Ok(n) => {
                debug!(
                    "Session {} {} dropping {} bytes read after close",
                    self.id, direction, n
                );
                None
            }
            Err(e) => {
                let (source, _) = self.endpoints(direction);
                self.handle_error(&mut state, direction, source, &e, location);
                None
            }
        }
    }

    /// Returns whether the direction should read again
    #[track_caller]
    fn on_write_complete(
        &self,
        direction: Direction,
        bytes: usize,
        written: TransportResult<()>,
    ) -> bool {
        let location = Location::caller();
        let mut state = self.lock_shutdown();

        match written {
            Ok(()) => {
                self.stats.record(direction, bytes);
                !state.closed
            }
            Err(e) => {
                let (_, destination) = self.endpoints(direction);
                self.handle_error(&mut state, direction, destination, &e, location);
                false
            }
        }
    }

    fn handle_error(
        &self,
        state: &mut ShutdownState,
        direction: Direction,
        origin: &dyn Transport,
        error: &TransportError,
        location: &'static Location<'static>,
    ) {
        let kind = classify(error, origin);
        if kind.is_reportable() {
            self.reporter.report(error, location);
        } else {
            debug!(
                "Session {} {} ended ({:?}): {}",
                self.id, direction, kind, error
            );
        }

        if state.cause.is_none() && !state.closed {
            state.cause = Some(kind);
        }
        self.close_locked(state);
    }

    fn close_locked(&self, state: &mut ShutdownState) {
        if state.closed {
            return;
        }
        state.closed = true;
        self.client.close();
        self.server.close();
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, ShutdownState> {
        // Shutdown must still go through if a holder panicked
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Running session plus its two pump tasks
pub struct RelayHandle {
    session: Arc<RelaySession>,
    client_to_server: JoinHandle<()>,
    server_to_client: JoinHandle<()>,
}

impl RelayHandle {
    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }

    /// Wait for both directions to stop
    pub async fn join(self) -> RelaySummary {
        let (a, b) = tokio::join!(self.client_to_server, self.server_to_client);
        for result in [a, b] {
            if let Err(e) = result {
                warn!("Relay session {} task failed: {}", self.session.id, e);
            }
        }
        // A panicked task never reached the shutdown path
        self.session.close();
        self.session.summary()
    }
}
