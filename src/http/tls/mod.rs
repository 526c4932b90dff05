//! TLS support for the harness server
//!
//! This module implements the TLS layer: configuration builders, the
//! encrypted session, handshake timing, and the credential provider that
//! issues a fresh self-signed certificate for every server instance.
//!
//! # Architecture
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsConfig` defines TLS settings (versions, ALPN, credentials)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. The HTTP/2 connection handler only sees `SessionOps`
//!
//! # Examples
//!
//! ```no_run
//! use idle_goaway::http::tls::{Credentials, TlsConfig};
//! use std::net::TcpListener;
//!
//! let credentials = Credentials::ephemeral_loopback().unwrap();
//! let tls_config = TlsConfig::server()
//!     .unwrap()
//!     .alpn(&["h2"])
//!     .unwrap()
//!     .credentials(&credentials)
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let listener = TcpListener::bind("127.0.0.1:8443").unwrap();
//! let (tcp_stream, _) = listener.accept().unwrap();
//! let tls_session = tls_config.accept(tcp_stream).unwrap();
//! assert!(tls_session.vars().is_h2());
//! ```

pub mod cert;
pub mod config;
pub mod handshake;
pub mod session;
pub mod vars;

pub use cert::{CertInfo, Credentials};
pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::TlsSessionOps;
pub use vars::TlsVars;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
