//! Idle watchdog
//!
//! Every connection gets exactly one watchdog thread. It wakes on a fixed
//! poll interval, so GOAWAY goes out between `threshold` and
//! `threshold + poll_interval` after the last stream activity. After the
//! grace period the TCP socket is shut down underneath the TLS session,
//! which is how a stale pooled connection looks to a client that missed or
//! ignored the GOAWAY.
//!
//! The GOAWAY write goes through the connection's frame emission lock, which
//! a writer blocked on a peer that stopped reading can hold indefinitely. It
//! is therefore handed to a short-lived sender thread; the grace clock and
//! the forced close never wait on it. Shutting the socket down is what
//! unblocks such a writer.

use super::connection::{ConnectionState, FrameSink, Phase};
use super::error::{Error, ErrorCode, Result};
use super::events::{ServerEventKind, ServerEvents};
use crate::config::IdlePolicy;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Handle on a running watchdog thread
pub struct IdleWatchdog {
    handle: JoinHandle<()>,
}

impl IdleWatchdog {
    /// Start the watchdog for `state`
    ///
    /// Fails if a watchdog was already started for this connection.
    pub fn spawn(
        state: Arc<ConnectionState>,
        sink: FrameSink,
        policy: IdlePolicy,
        events: ServerEvents,
    ) -> Result<Self> {
        if !state.arm_watchdog() {
            return Err(Error::Internal(format!(
                "watchdog already armed for connection {}",
                state.id()
            )));
        }

        let tcp = sink.try_clone_tcp()?;
        let handle = thread::Builder::new()
            .name(format!("watchdog-{}", state.id()))
            .spawn(move || watch(&state, &sink, tcp, policy, &events))
            .map_err(|e| Error::Internal(format!("failed to spawn watchdog: {}", e)))?;

        Ok(IdleWatchdog { handle })
    }

    /// Wait for the watchdog to exit
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn watch(
    state: &ConnectionState,
    sink: &FrameSink,
    tcp: TcpStream,
    policy: IdlePolicy,
    events: &ServerEvents,
) {
    let last_stream_id = loop {
        thread::sleep(policy.poll_interval);
        if state.is_closing() {
            return;
        }
        if let Some(last_stream_id) = state.try_begin_goaway(policy.threshold) {
            break last_stream_id;
        }
    };

    state.advance(Phase::GoawaySent);
    let grace_deadline = Instant::now() + policy.grace;
    let sender = spawn_goaway(state, sink, last_stream_id);

    if let Some((_, done)) = &sender {
        match done.recv_timeout(policy.grace) {
            Ok(Ok(())) => {
                info!(
                    conn = state.id(),
                    last_stream_id,
                    idle_ms = state.idle_for().as_millis() as u64,
                    "idle threshold reached, sent GOAWAY"
                );
                events.record(state.id(), ServerEventKind::GoawaySent { last_stream_id });
            }
            Ok(Err(e)) => warn!(conn = state.id(), "failed to send GOAWAY: {}", e),
            Err(RecvTimeoutError::Timeout) => {
                warn!(conn = state.id(), "GOAWAY write stalled for the whole grace period")
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(conn = state.id(), "GOAWAY sender exited without a result")
            }
        }
    }

    let remaining = grace_deadline.saturating_duration_since(Instant::now());
    let closed_early = !sleep_unless_closed(state, remaining, policy.poll_interval);
    if closed_early {
        debug!(conn = state.id(), "connection closed during grace period");
    } else {
        state.advance(Phase::Closing);
        match tcp.shutdown(Shutdown::Both) {
            Ok(()) => {
                info!(conn = state.id(), "grace period over, closed TCP socket");
                events.record(state.id(), ServerEventKind::SocketClosed);
            }
            Err(e) => debug!(conn = state.id(), "socket already gone: {}", e),
        }
    }

    // The socket is down by now (ours or the connection's), so a stalled
    // write has been released
    if let Some((handle, _)) = sender {
        let _ = handle.join();
    }
}

type GoawaySender = (JoinHandle<()>, mpsc::Receiver<Result<()>>);

/// Write GOAWAY(NO_ERROR) from a separate thread
fn spawn_goaway(state: &ConnectionState, sink: &FrameSink, last_stream_id: u32) -> Option<GoawaySender> {
    let (tx, rx) = mpsc::channel();
    let sink = sink.clone();
    let spawned = thread::Builder::new()
        .name(format!("goaway-{}", state.id()))
        .spawn(move || {
            let _ = tx.send(sink.send_goaway(last_stream_id, ErrorCode::NoError));
        });

    match spawned {
        Ok(handle) => Some((handle, rx)),
        Err(e) => {
            warn!(conn = state.id(), "failed to spawn GOAWAY sender: {}", e);
            None
        }
    }
}

/// Sleep for `total` in `step`s; false if the connection started closing
fn sleep_unless_closed(state: &ConnectionState, total: Duration, step: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if state.is_closing() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(step.min(deadline - now));
    }
}
