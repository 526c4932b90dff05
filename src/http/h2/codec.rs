//! HTTP/2 frame encoding and decoding
//!
//! Encoders produce complete wire frames (header plus payload) as `Bytes`.
//! Decoding is incremental: received bytes are fed into a `FrameCodec`, which
//! hands back whole frames as soon as they are buffered.

use super::error::{Error, Result};
use super::frames::*;
use super::{CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest payload the 24-bit length field can describe (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec {
    /// Buffer for reading
    read_buffer: BytesMut,
    /// Client preface still expected at the head of the stream
    expect_preface: bool,
    /// Largest payload accepted from the peer
    max_frame_size: usize,
    /// Frames of unknown type dropped so far
    skipped: u64,
}

impl FrameCodec {
    /// Create a codec that starts decoding frames immediately
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(4096),
            expect_preface: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
            skipped: 0,
        }
    }

    /// Create a server-side codec that validates the client connection preface first
    pub fn with_preface() -> Self {
        FrameCodec {
            expect_preface: true,
            ..Self::new()
        }
    }

    /// Raise or lower the largest accepted payload
    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size.min(MAX_FRAME_SIZE);
    }

    /// Number of unknown-type frames skipped
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Append bytes received from the peer
    pub fn feed(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    /// Decode the next complete frame
    ///
    /// Returns `Ok(None)` when more bytes are needed. Frames of unknown type
    /// are discarded (RFC 9113 Section 4.1).
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.expect_preface {
            let have = self.read_buffer.len().min(CONNECTION_PREFACE.len());
            if self.read_buffer[..have] != CONNECTION_PREFACE[..have] {
                return Err(Error::MissingPreface);
            }
            if have < CONNECTION_PREFACE.len() {
                return Ok(None);
            }
            self.read_buffer.advance(CONNECTION_PREFACE.len());
            self.expect_preface = false;
        }

        loop {
            if self.read_buffer.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let mut header = [0u8; FRAME_HEADER_SIZE];
            header.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
            let (type_byte, flags, stream_id, length) = Self::decode_header(&header);

            if length > self.max_frame_size {
                return Err(Error::FrameSize(format!(
                    "Frame payload too large: {} > {}",
                    length, self.max_frame_size
                )));
            }

            if self.read_buffer.len() < FRAME_HEADER_SIZE + length {
                return Ok(None);
            }

            self.read_buffer.advance(FRAME_HEADER_SIZE);
            let payload = self.read_buffer.split_to(length).freeze();

            match FrameType::from_u8(type_byte) {
                Some(frame_type) => {
                    return Ok(Some(Frame::new(frame_type, flags, stream_id, payload)));
                }
                None => self.skipped += 1,
            }
        }
    }

    /// Encode a frame header into a buffer
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header from bytes
    ///
    /// The type is returned as its raw octet so callers can tell unknown
    /// frame types apart.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let flags = FrameFlags::from_u8(bytes[4]);
        // Ignore the reserved bit
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        (bytes[3], flags, stream_id, length)
    }

    fn frame(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(frame_type, flags, stream_id, payload.len()));
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        Self::frame(FrameType::Data, flags, frame.stream_id, &frame.data)
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        Self::frame(FrameType::Headers, flags, frame.stream_id, &frame.header_block)
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        if frame.ack {
            return Self::frame(FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, &[]);
        }
        // Stream ID must be 0 for SETTINGS
        Self::frame(FrameType::Settings, FrameFlags::empty(), 0, &frame.settings.encode())
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };
        Self::frame(FrameType::Ping, flags, 0, &frame.data)
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut payload = BytesMut::with_capacity(8 + frame.debug_data.len());
        payload.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        payload.put_u32(frame.error_code.as_u32());
        payload.put_slice(&frame.debug_data);

        // Stream ID must be 0 for GOAWAY
        Self::frame(FrameType::Goaway, FrameFlags::empty(), 0, &payload)
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let increment = (frame.size_increment & 0x7FFFFFFF).to_be_bytes();
        Self::frame(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, &increment)
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let code = frame.error_code.as_u32().to_be_bytes();
        Self::frame(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, &code)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
