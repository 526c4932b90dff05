//! HTTP/2 server: connection acceptor
//!
//! `H2Server` binds a TLS listener that only speaks `h2` and runs every
//! accepted connection on its own thread, paired with its own idle watchdog.
//! A failing connection is logged and dropped; it never takes the acceptor
//! down with it.

use super::connection::{Connection, ConnectionState, FrameSink, Phase};
use super::error::{ErrorCode, Result};
use super::events::{ServerEventKind, ServerEvents};
use super::watchdog::IdleWatchdog;
use super::SESSION_READ_TIMEOUT;
use crate::config::ServerConfig;
use crate::http::session::{poll_fd, PollEvents};
use crate::http::tls::handshake::{
    arm_handshake_timeout, arm_session_timeouts, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
};
use crate::http::tls::{CertInfo, Credentials, TlsConfig, TlsError, TlsVersion};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Listen backlog
const BACKLOG: i32 = 128;

/// How often the accept loop checks for shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// A bound, not yet running HTTP/2 server
pub struct H2Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: TlsConfig,
    cert: CertInfo,
    config: ServerConfig,
    events: ServerEvents,
}

impl H2Server {
    /// Bind the listener and prepare TLS with a fresh certificate
    ///
    /// Fails if the address is in use or the certificate cannot be issued.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let credentials = Credentials::ephemeral_loopback()?;
        let tls = TlsConfig::server()?
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)?
            .alpn(&["h2"])?
            .credentials(&credentials)?
            .build()?;

        let domain = match config.bind {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&config.bind.into())?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening (h2 over TLS)");

        Ok(H2Server {
            listener,
            local_addr,
            tls,
            cert: credentials.info(),
            config,
            events: ServerEvents::new(),
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subject and SANs of the server certificate
    pub fn certificate(&self) -> &CertInfo {
        &self.cert
    }

    pub fn events(&self) -> &ServerEvents {
        &self.events
    }

    /// Run the accept loop on a background thread
    pub fn spawn(self) -> Result<ServerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let local_addr = self.local_addr;
        let events = self.events.clone();

        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("h2-acceptor".to_string())
            .spawn(move || self.serve(&flag))?;

        Ok(ServerHandle {
            local_addr,
            events,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Accept connections until `shutdown` is raised
    pub fn serve(self, shutdown: &AtomicBool) {
        let next_id = AtomicU64::new(1);
        let tls = Arc::new(self.tls);

        while !shutdown.load(Ordering::Acquire) {
            match poll_fd(self.listener.as_raw_fd(), PollEvents::Read, Some(ACCEPT_POLL)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("listener poll failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
            }

            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let tls = Arc::clone(&tls);
            let config = self.config.clone();
            let events = self.events.clone();

            let spawned = thread::Builder::new()
                .name(format!("h2-conn-{}", id))
                .spawn(move || serve_connection(id, stream, peer, &tls, &config, &events));
            if let Err(e) = spawned {
                warn!(conn = id, "failed to spawn connection thread: {}", e);
            }
        }

        debug!(addr = %self.local_addr, "acceptor stopped");
    }
}

/// Handle on a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    events: ServerEvents,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Lifecycle events of every connection this server accepted
    pub fn events(&self) -> &ServerEvents {
        &self.events
    }

    /// `https://localhost:<port><path>`
    pub fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.local_addr.port(), path)
    }

    /// Stop accepting; returns once the accept loop has exited
    ///
    /// Connections already accepted run on until their peer or watchdog
    /// closes them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_connection(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    tls: &TlsConfig,
    config: &ServerConfig,
    events: &ServerEvents,
) {
    let setup = stream
        .set_nonblocking(false)
        .map_err(TlsError::from)
        .and_then(|()| {
            arm_handshake_timeout(&stream, Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS))
        });
    if let Err(e) = setup {
        warn!(conn = id, %peer, "socket setup failed: {}", e);
        return;
    }

    let session = match tls.accept(stream) {
        Ok(session) => session,
        Err(e) => {
            warn!(conn = id, %peer, "TLS handshake failed: {}", e);
            return;
        }
    };
    if !session.vars().is_h2() {
        let err = TlsError::AlpnFailed(session.vars().alpn.clone());
        warn!(conn = id, %peer, "{}", err);
        return;
    }
    if let Err(e) = arm_session_timeouts(session.get_ref(), SESSION_READ_TIMEOUT) {
        warn!(conn = id, %peer, "socket setup failed: {}", e);
        return;
    }

    info!(conn = id, %peer, tls = %session.vars().version, "connection accepted");

    let state = Arc::new(ConnectionState::new(id, peer));
    let sink = FrameSink::new(session);
    events.record(id, ServerEventKind::Accepted);

    let watchdog = match IdleWatchdog::spawn(
        Arc::clone(&state),
        sink.clone(),
        config.idle,
        events.clone(),
    ) {
        Ok(watchdog) => Some(watchdog),
        Err(e) => {
            warn!(conn = id, "no idle watchdog: {}", e);
            None
        }
    };

    let mut conn = Connection::new(
        Arc::clone(&state),
        sink.clone(),
        config.stream,
        config.idle.poll_interval,
    );

    match conn.run() {
        Ok(()) => debug!(conn = id, phase = state.phase().name(), "read loop finished"),
        Err(e) => {
            warn!(conn = id, phase = state.phase().name(), "connection error: {}", e);
            let code = e.code();
            if code != ErrorCode::InternalError && !state.is_closing() && !state.goaway_sent() {
                let _ = sink.send_goaway(state.last_stream_id(), code);
            }
        }
    }

    state.advance(Phase::Closing);
    if let Err(e) = sink.close() {
        debug!(conn = id, "close failed: {}", e);
    }
    state.advance(Phase::Closed);

    if let Some(watchdog) = watchdog {
        watchdog.join();
    }
    conn.join_emitters();

    events.record(id, ServerEventKind::Closed);
    info!(conn = id, requests = state.requests(), "connection closed");
}
