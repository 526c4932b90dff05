//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections.

use super::config::{TlsConfig, TlsError};
use super::vars::TlsVars;
use crate::http::session::SessionOps;
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

/// TLS session operations
///
/// Implements SessionOps trait for TLS-encrypted connections.
/// Wraps an OpenSSL SslStream and provides read/write/close operations.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    vars: TlsVars,
    failed: bool,
}

impl TlsSessionOps {
    /// Create a client TLS connection (perform handshake)
    pub fn connect(tcp_stream: TcpStream, config: TlsConfig) -> std::result::Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;

        // Set SNI servername if configured
        if let Some(ref servername) = config.servername {
            ssl.set_hostname(servername)?;
        }

        let ssl_stream = ssl
            .connect(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Connection failed: {}", e)))?;

        let vars = TlsVars::from_ssl(ssl_stream.ssl());

        Ok(TlsSessionOps {
            stream: ssl_stream,
            vars,
            failed: false,
        })
    }

    /// Accept a client connection with TLS (perform handshake)
    pub fn accept(tcp_stream: TcpStream, config: TlsConfig) -> std::result::Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;

        let ssl_stream = ssl
            .accept(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))?;

        let vars = TlsVars::from_ssl(ssl_stream.ssl());

        Ok(TlsSessionOps {
            stream: ssl_stream,
            vars,
            failed: false,
        })
    }

    /// Get negotiated TLS variables
    pub fn vars(&self) -> &TlsVars {
        &self.vars
    }

    /// Check if TLS I/O failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Raw descriptor of the underlying socket
    pub fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    /// Decrypted bytes buffered inside OpenSSL and not yet read
    pub fn pending(&self) -> usize {
        self.stream.ssl().pending()
    }

    /// Independent handle to the underlying TCP socket
    ///
    /// Shutting the clone down tears the connection down for every holder,
    /// without touching the TLS state.
    pub fn try_clone_tcp(&self) -> io::Result<TcpStream> {
        self.stream.get_ref().try_clone()
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    fn mark_failed(&mut self, err: io::Error) -> Error {
        if !matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
            self.failed = true;
        }
        Error::Io(err)
    }
}

impl SessionOps for TlsSessionOps {
    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.mark_failed(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.mark_failed(e)),
        }
    }

    fn flush(&mut self) -> HttpResult<()> {
        match self.stream.flush() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.mark_failed(e)),
        }
    }

    fn close(&mut self) -> HttpResult<()> {
        // Perform SSL shutdown if not failed
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already torn down by the peer or by a forced close
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}
