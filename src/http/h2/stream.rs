//! Per-stream request context
//!
//! A `StreamContext` is created when a request's header block completes and
//! lives until both directions of the stream are closed or it is reset.

use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

/// How a stream is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// One response, headers plus body
    Unary,
    /// Headers, then a fixed sequence of delayed chunks
    ServerStream,
    /// One reply per inbound DATA frame, terminal record on half-close
    BidiStream,
}

impl StreamMode {
    pub fn name(&self) -> &'static str {
        match self {
            StreamMode::Unary => "unary",
            StreamMode::ServerStream => "server-stream",
            StreamMode::BidiStream => "bidi-stream",
        }
    }
}

/// State of one request stream
#[derive(Debug)]
pub struct StreamContext {
    id: StreamId,
    headers: HashMap<String, String>,
    mode: StreamMode,
    /// Response chunks emitted so far
    chunks: u32,
    /// Non-empty DATA frames received
    inbound: u32,
    local_closed: bool,
    remote_closed: bool,
}

impl StreamContext {
    /// Create the context for a stream whose request headers just arrived
    pub fn new(id: StreamId, headers: HashMap<String, String>, mode: StreamMode) -> Self {
        StreamContext {
            id,
            headers,
            mode,
            chunks: 0,
            inbound: 0,
            local_closed: false,
            remote_closed: false,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Request header by lowercase name (pseudo-headers included)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn method(&self) -> &str {
        self.header(":method").unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.header(":path").unwrap_or("")
    }

    /// Number of response chunks emitted
    pub fn chunks(&self) -> u32 {
        self.chunks
    }

    /// Count one more emitted chunk and return its 1-based ordinal
    pub fn next_chunk(&mut self) -> u32 {
        self.chunks += 1;
        self.chunks
    }

    /// Count one inbound DATA payload
    ///
    /// Returns the 1-based ordinal of the frame, or `None` for an empty
    /// payload (a bare END_STREAM carries no request chunk).
    pub fn receive_data(&mut self, data: &[u8]) -> Option<u32> {
        if data.is_empty() {
            return None;
        }
        self.inbound += 1;
        Some(self.inbound)
    }

    /// Record the peer's END_STREAM
    pub fn close_remote(&mut self) {
        self.remote_closed = true;
    }

    /// Record that our side sent END_STREAM (or gave up the stream)
    pub fn close_local(&mut self) {
        self.local_closed = true;
    }

    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    pub fn local_closed(&self) -> bool {
        self.local_closed
    }

    /// Both directions are done
    pub fn is_closed(&self) -> bool {
        self.local_closed && self.remote_closed
    }
}
