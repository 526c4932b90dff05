//! Newline-delimited JSON records exchanged on `/stream`
//!
//! Both ends of the harness speak ndjson: the server emits one record per
//! DATA frame and the client may see several records coalesced into one
//! body chunk (or one record split over two). `LineBuffer` restores the
//! record boundaries on the client side.

use serde::{Deserialize, Serialize};

/// A record on the `/stream` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamRecord {
    /// Server-streaming chunk `n` of `total`
    Chunk { chunk: u32, total: u32 },
    /// Echo of the `n`th inbound DATA frame
    Echo { echo: u64 },
    /// Terminal record of a duplex exchange
    Done { done: bool },
}

impl StreamRecord {
    /// Terminal `{"done":true}` record
    pub fn done() -> Self {
        StreamRecord::Done { done: true }
    }

    /// Whether this is the terminal record
    pub fn is_done(&self) -> bool {
        matches!(self, StreamRecord::Done { done: true })
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parse one line, returning `None` for anything that is not a record
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Reassembles lines from arbitrarily split byte chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every line it completed
    ///
    /// Blank lines are dropped; a trailing `\r` is stripped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            if let Some(line) = Self::clean(&raw[..pos]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Take the unterminated remainder, if it holds anything
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.partial);
        Self::clean(&raw)
    }

    /// Bytes held while waiting for a newline
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    fn clean(raw: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}
