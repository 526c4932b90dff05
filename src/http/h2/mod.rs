//! Minimal HTTP/2 server engine
//!
//! This module implements just enough of HTTP/2 (RFC 9113) to serve the three
//! response strategies of the harness and to misbehave on purpose: idle
//! connections receive a GOAWAY and, after a grace period, lose their TCP
//! socket.
//!
//! # Architecture
//!
//! - `server`: TLS acceptor, one thread per connection
//! - `connection`: read loop, frame handling and the shared `FrameSink`
//! - `watchdog`: per-connection idle timer (GOAWAY, then forced close)
//! - `router` / `strategy`: request dispatch and response emission
//! - `codec` / `frames` / `settings`: wire format
//! - `events`: lifecycle log the scenario runner inspects
//!
//! Flow control is not enforced; received DATA is acknowledged with
//! WINDOW_UPDATE as soon as it is read.
//!
//! # Examples
//!
//! ```no_run
//! use idle_goaway::config::{IdlePolicy, ServerConfig};
//! use idle_goaway::http::h2::H2Server;
//! use std::time::Duration;
//!
//! let config = ServerConfig::default()
//!     .port(0)
//!     .idle(IdlePolicy::default().threshold(Duration::from_secs(1)));
//! let handle = H2Server::bind(config).unwrap().spawn().unwrap();
//! println!("GET {}", handle.url("/test"));
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod events;
pub mod frames;
pub mod router;
pub mod server;
pub mod settings;
pub mod strategy;
pub mod stream;
pub mod watchdog;

pub use codec::FrameCodec;
pub use connection::{ConnectionState, FrameSink, Phase};
pub use error::{Error, ErrorCode, Result};
pub use events::{ServerEvent, ServerEventKind, ServerEvents};
pub use frames::{Frame, FrameFlags, FrameType, GoawayFrame};
pub use router::Route;
pub use server::{H2Server, ServerHandle};
pub use settings::Settings;
pub use stream::{StreamContext, StreamId, StreamMode};
pub use watchdog::IdleWatchdog;

use std::time::Duration;

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 9113 Section 3.4:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Socket read timeout once a connection is established
///
/// Bounds how long the read loop can hold the transport lock while OpenSSL
/// waits for the rest of a TLS record.
pub const SESSION_READ_TIMEOUT: Duration = Duration::from_millis(50);
