//! Server event log
//!
//! Connection handlers and watchdogs append lifecycle events here. The log is
//! append-only; observers take a `mark()` and later read what happened since.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// What happened to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEventKind {
    /// TLS handshake completed and the connection handler started
    Accepted,
    /// The watchdog sent GOAWAY
    GoawaySent { last_stream_id: u32 },
    /// The watchdog force-closed the TCP socket
    SocketClosed,
    /// The connection handler exited
    Closed,
}

/// One log entry
#[derive(Debug, Clone, Copy)]
pub struct ServerEvent {
    /// Connection number, unique per server
    pub conn: u64,
    pub at: Instant,
    pub kind: ServerEventKind,
}

/// Shared, append-only event log
///
/// Entries are never dropped, so the log grows by a handful of events per
/// accepted connection for the lifetime of the server. A harness round
/// starts a fresh server, which keeps that bounded.
#[derive(Debug, Clone, Default)]
pub struct ServerEvents {
    inner: Arc<Mutex<Vec<ServerEvent>>>,
}

impl ServerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ServerEvent>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event
    pub fn record(&self, conn: u64, kind: ServerEventKind) {
        self.entries().push(ServerEvent {
            conn,
            at: Instant::now(),
            kind,
        });
    }

    /// Position of the next event to be recorded
    pub fn mark(&self) -> usize {
        self.entries().len()
    }

    /// Events recorded at or after `mark`
    pub fn since(&self, mark: usize) -> Vec<ServerEvent> {
        self.entries().iter().skip(mark).copied().collect()
    }

    /// Every event recorded so far
    pub fn snapshot(&self) -> Vec<ServerEvent> {
        self.since(0)
    }

    /// GOAWAYs sent since `mark`
    pub fn goaways_since(&self, mark: usize) -> usize {
        self.since(mark)
            .iter()
            .filter(|e| matches!(e.kind, ServerEventKind::GoawaySent { .. }))
            .count()
    }

    /// Sockets force-closed since `mark`
    pub fn sockets_closed_since(&self, mark: usize) -> usize {
        self.since(mark)
            .iter()
            .filter(|e| e.kind == ServerEventKind::SocketClosed)
            .count()
    }

    /// Poll until `pred` holds for the whole log or `timeout` elapses
    pub fn wait_for<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[ServerEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.entries()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
