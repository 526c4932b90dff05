//! HTTP transport layer for the idle-GOAWAY harness
//!
//! This module holds everything that touches the wire on the server side:
//! the TLS layer (`tls`), the minimal HTTP/2 engine (`h2`), and the session
//! operations abstraction both of them share.
//!
//! # Architecture
//!
//! The transport uses a session operations abstraction pattern:
//!
//! - `SessionOps` trait defines operations (poll, read, write, flush, close)
//! - `TlsSessionOps` implements it on top of an OpenSSL stream
//! - The HTTP/2 connection handler only ever talks to `SessionOps`
//!
//! # Examples
//!
//! ```no_run
//! use idle_goaway::config::ServerConfig;
//! use idle_goaway::http::h2::H2Server;
//!
//! let server = H2Server::bind(ServerConfig::default()).unwrap();
//! let handle = server.spawn().unwrap();
//! println!("listening on {}", handle.local_addr());
//! handle.shutdown();
//! ```

pub mod h2;
pub mod session;
pub mod tls;

pub use session::{poll_fd, PollEvents, SessionOps};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether the error only means "no data yet" on a socket with a read timeout
    pub fn is_would_block(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            Error::Timeout => true,
            Error::ConnectionClosed => false,
        }
    }
}
