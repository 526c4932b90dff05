//! TLS handshake timing
//!
//! The handshake itself is performed by `Ssl::accept()` / `Ssl::connect()` in
//! the session module. This module bounds how long a silent peer can hold a
//! connection thread inside that blocking call, and restores the short read
//! timeout the connection read loop relies on afterwards.

use super::config::TlsError;
use std::net::TcpStream;
use std::time::Duration;

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Handshake result helper
pub type HandshakeResult = std::result::Result<(), TlsError>;

/// Bound the blocking handshake on `stream`
pub fn arm_handshake_timeout(stream: &TcpStream, timeout: Duration) -> HandshakeResult {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(())
}

/// Switch `stream` to the post-handshake timeouts
///
/// Reads time out after `read_timeout` so a partially received TLS record
/// never parks the reader for long. Writes block until the peer drains them;
/// a peer that never does is cut off by the idle watchdog's forced close.
pub fn arm_session_timeouts(stream: &TcpStream, read_timeout: Duration) -> HandshakeResult {
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_write_timeout(None)?;
    Ok(())
}
