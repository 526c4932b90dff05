//! HTTP/2 connection handler
//!
//! One `Connection` runs per accepted socket, on its own thread. It owns the
//! decoding half of the protocol engine (frame codec, HPACK decoder, stream
//! table) and shares the encoding half with the idle watchdog and the
//! streaming emitters through a `FrameSink`.
//!
//! # Locking
//!
//! Two locks exist per connection and neither is held while waiting for the
//! peer:
//!
//! - the activity lock in `ConnectionState` guards the last-activity
//!   timestamp, the GOAWAY flag and the highest admitted stream, so that
//!   "GOAWAY freezes activity" and "no stream is admitted past the announced
//!   last stream" hold atomically;
//! - the transport lock in `FrameSink` guards the TLS session together with
//!   the HPACK encoder, so header blocks hit the wire in the order their
//!   dynamic-table updates were made.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::router::{self, Route};
use super::settings::Settings;
use super::strategy;
use super::stream::{StreamContext, StreamId, StreamMode};
use super::{CONNECTION_STREAM_ID, DEFAULT_MAX_FRAME_SIZE};
use crate::config::StreamPolicy;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::tls::TlsSessionOps;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Connection lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Active = 0,
    GoawaySent = 1,
    Closing = 2,
    Closed = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Active,
            1 => Phase::GoawaySent,
            2 => Phase::Closing,
            _ => Phase::Closed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Active => "ACTIVE",
            Phase::GoawaySent => "GOAWAY_SENT",
            Phase::Closing => "CLOSING",
            Phase::Closed => "CLOSED",
        }
    }
}

#[derive(Debug)]
struct Activity {
    last: Instant,
    goaway_sent: bool,
    last_stream_id: StreamId,
}

/// Shared per-connection state
#[derive(Debug)]
pub struct ConnectionState {
    id: u64,
    peer: SocketAddr,
    activity: Mutex<Activity>,
    phase: AtomicU8,
    requests: AtomicU64,
    watchdog_armed: AtomicBool,
}

impl ConnectionState {
    /// State for a freshly accepted connection: ACTIVE, last activity now
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        ConnectionState {
            id,
            peer,
            activity: Mutex::new(Activity {
                last: Instant::now(),
                goaway_sent: false,
                last_stream_id: 0,
            }),
            phase: AtomicU8::new(Phase::Active as u8),
            requests: AtomicU64::new(0),
            watchdog_armed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh last activity; a no-op once GOAWAY has been sent
    ///
    /// Returns whether the timestamp moved.
    pub fn touch(&self) -> bool {
        let mut activity = self.activity();
        if activity.goaway_sent {
            return false;
        }
        activity.last = activity.last.max(Instant::now());
        true
    }

    /// Time since the last activity
    pub fn idle_for(&self) -> Duration {
        self.activity().last.elapsed()
    }

    /// Admit a new request stream
    ///
    /// Refused (returns false) once GOAWAY has been sent, so every admitted
    /// stream is covered by the last-stream-id the GOAWAY announces.
    pub fn admit_stream(&self, stream_id: StreamId) -> bool {
        let mut activity = self.activity();
        if activity.goaway_sent {
            return false;
        }
        activity.last_stream_id = activity.last_stream_id.max(stream_id);
        activity.last = activity.last.max(Instant::now());
        true
    }

    /// Highest stream id admitted so far
    pub fn last_stream_id(&self) -> StreamId {
        self.activity().last_stream_id
    }

    /// Flip the GOAWAY flag if the connection has been idle for `threshold`
    ///
    /// Returns the last-stream-id to announce. Succeeds at most once per
    /// connection.
    pub fn try_begin_goaway(&self, threshold: Duration) -> Option<StreamId> {
        let mut activity = self.activity();
        if activity.goaway_sent || activity.last.elapsed() < threshold {
            return None;
        }
        activity.goaway_sent = true;
        Some(activity.last_stream_id)
    }

    pub fn goaway_sent(&self) -> bool {
        self.activity().goaway_sent
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move to `phase` unless the connection is already past it
    pub fn advance(&self, phase: Phase) -> Phase {
        Phase::from_u8(self.phase.fetch_max(phase as u8, Ordering::AcqRel))
    }

    /// The connection is being or has been torn down
    pub fn is_closing(&self) -> bool {
        self.phase() >= Phase::Closing
    }

    /// Number the next request on this connection (1-based)
    pub fn next_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Requests served so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Claim the single watchdog slot
    pub fn arm_watchdog(&self) -> bool {
        self.watchdog_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Transport {
    tls: TlsSessionOps,
    encoder: hpack::Encoder<'static>,
}

/// Serialized frame emission for one connection
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<Mutex<Transport>>,
    fd: RawFd,
    /// Largest DATA payload the peer accepts
    max_frame_size: Arc<AtomicU32>,
}

impl FrameSink {
    pub fn new(tls: TlsSessionOps) -> Self {
        let fd = tls.raw_fd();
        FrameSink {
            inner: Arc::new(Mutex::new(Transport {
                tls,
                encoder: hpack::Encoder::new(),
            })),
            fd,
            max_frame_size: Arc::new(AtomicU32::new(DEFAULT_MAX_FRAME_SIZE)),
        }
    }

    /// Apply the peer's SETTINGS_MAX_FRAME_SIZE to outgoing DATA
    pub fn set_max_frame_size(&self, size: u32) {
        self.max_frame_size.store(size, Ordering::Relaxed);
    }

    fn transport(&self) -> MutexGuard<'_, Transport> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw socket descriptor, for waiting on readability without the lock
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Decrypted bytes already buffered in the TLS layer
    pub fn pending(&self) -> usize {
        self.transport().tls.pending()
    }

    /// Read whatever the TLS layer can hand over right now
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.transport().tls.read(buf)?)
    }

    /// Write already encoded frames
    pub fn send(&self, frames: &[u8]) -> Result<()> {
        Ok(self.transport().tls.write_all(frames)?)
    }

    pub fn send_settings(&self, settings: &Settings) -> Result<()> {
        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::new(settings.clone())))
    }

    pub fn send_settings_ack(&self) -> Result<()> {
        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()))
    }

    pub fn send_ping_ack(&self, data: [u8; 8]) -> Result<()> {
        self.send(&FrameCodec::encode_ping_frame(&PingFrame::ack(data)))
    }

    pub fn send_goaway(&self, last_stream_id: StreamId, error_code: ErrorCode) -> Result<()> {
        let frame = GoawayFrame::new(last_stream_id, error_code, Bytes::new());
        self.send(&FrameCodec::encode_goaway_frame(&frame))
    }

    pub fn send_window_update(&self, stream_id: StreamId, size_increment: u32) -> Result<()> {
        let frame = WindowUpdateFrame::new(stream_id, size_increment);
        self.send(&FrameCodec::encode_window_update_frame(&frame))
    }

    pub fn send_rst_stream(&self, stream_id: StreamId, error_code: ErrorCode) -> Result<()> {
        self.send(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
            stream_id,
            error_code,
        }))
    }

    /// Send a response header block, optionally followed by a body
    ///
    /// Everything goes out under one lock acquisition so no other frame can
    /// land between the HEADERS and its DATA.
    pub fn send_response(
        &self,
        stream_id: StreamId,
        status: u16,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
        end_stream: bool,
    ) -> Result<()> {
        let status = status.to_string();
        let mut fields: Vec<(&[u8], &[u8])> = vec![(b":status", status.as_bytes())];
        fields.extend(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));

        let mut transport = self.transport();

        let mut block = Vec::new();
        transport
            .encoder
            .encode_into(fields, &mut block)
            .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;

        let headers_only = body.is_none() && end_stream;
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            stream_id,
            Bytes::from(block),
            headers_only,
            true,
        )));
        if let Some(body) = body {
            self.encode_data(&mut wire, stream_id, body, end_stream);
        }

        transport.tls.write_all(&wire)?;
        Ok(())
    }

    /// Send body bytes, split to the peer's maximum frame size
    pub fn send_data(&self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        let mut wire = BytesMut::new();
        self.encode_data(&mut wire, stream_id, data, end_stream);
        self.send(&wire)
    }

    fn encode_data(&self, wire: &mut BytesMut, stream_id: StreamId, data: &[u8], end_stream: bool) {
        let max = self.max_frame_size.load(Ordering::Relaxed) as usize;
        if data.is_empty() {
            let frame = DataFrame::new(stream_id, Bytes::new(), end_stream);
            wire.extend_from_slice(&FrameCodec::encode_data_frame(&frame));
            return;
        }

        let mut chunks = data.chunks(max).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let frame = DataFrame::new(stream_id, Bytes::copy_from_slice(chunk), end_stream && last);
            wire.extend_from_slice(&FrameCodec::encode_data_frame(&frame));
        }
    }

    /// Close the TLS session and the socket
    pub fn close(&self) -> Result<()> {
        Ok(self.transport().tls.close()?)
    }

    /// Independent handle on the TCP socket for forced closes
    pub fn try_clone_tcp(&self) -> Result<TcpStream> {
        Ok(self.transport().tls.try_clone_tcp()?)
    }
}

/// A running server-stream emitter
struct Emitter {
    stream_id: StreamId,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct PendingHeaders {
    stream_id: StreamId,
    end_stream: bool,
    block: BytesMut,
}

/// The read side of one HTTP/2 connection
pub struct Connection {
    state: Arc<ConnectionState>,
    sink: FrameSink,
    codec: FrameCodec,
    decoder: hpack::Decoder<'static>,
    streams: HashMap<StreamId, StreamContext>,
    pending_headers: Option<PendingHeaders>,
    highest_stream: StreamId,
    remote_settings: Settings,
    stream_policy: StreamPolicy,
    poll_interval: Duration,
    emitters: Vec<Emitter>,
}

impl Connection {
    pub fn new(
        state: Arc<ConnectionState>,
        sink: FrameSink,
        stream_policy: StreamPolicy,
        poll_interval: Duration,
    ) -> Self {
        Connection {
            state,
            sink,
            codec: FrameCodec::with_preface(),
            decoder: hpack::Decoder::new(),
            streams: HashMap::new(),
            pending_headers: None,
            highest_stream: 0,
            remote_settings: Settings::default(),
            stream_policy,
            poll_interval,
            emitters: Vec::new(),
        }
    }

    /// Serve the connection until the peer leaves or the socket is closed
    ///
    /// Returns `Ok(())` on a clean EOF or a forced close.
    pub fn run(&mut self) -> Result<()> {
        self.sink.send_settings(&Settings::server_initial())?;

        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if self.state.is_closing() {
                return Ok(());
            }

            if self.sink.pending() == 0
                && !poll_fd(self.sink.raw_fd(), PollEvents::Read, Some(self.poll_interval))?
            {
                continue;
            }

            let n = match self.sink.read(&mut buf) {
                Ok(0) => {
                    debug!(conn = self.state.id(), "peer closed the connection");
                    return Ok(());
                }
                Ok(n) => n,
                Err(Error::Session(e)) if e.is_would_block() => continue,
                // A forced close surfaces as a reset or similar; not an error here
                Err(_) if self.state.is_closing() => return Ok(()),
                Err(e) => return Err(e),
            };

            self.codec.feed(&buf[..n]);
            while let Some(frame) = self.codec.decode()? {
                self.handle_frame(frame)?;
            }
        }
    }

    /// Wait for streaming emitters still running on this connection
    pub fn join_emitters(&mut self) {
        for emitter in self.emitters.drain(..) {
            let _ = emitter.handle.join();
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        trace!(
            conn = self.state.id(),
            stream = frame.stream_id,
            "recv {} flags=0x{:x} len={}",
            frame.frame_type.name(),
            frame.flags.as_u8(),
            frame.payload_len()
        );

        if self.pending_headers.is_some() && frame.frame_type != FrameType::Continuation {
            return Err(Error::Protocol(format!(
                "{} received while a header block is open",
                frame.frame_type.name()
            )));
        }

        match frame.frame_type {
            FrameType::Settings => self.on_settings(&frame),
            FrameType::Ping => {
                let ping = PingFrame::decode(&frame)?;
                if !ping.ack {
                    self.sink.send_ping_ack(ping.data)?;
                }
                Ok(())
            }
            FrameType::Headers => self.on_headers(&frame),
            FrameType::Continuation => self.on_continuation(&frame),
            FrameType::Data => self.on_data(&frame),
            FrameType::RstStream => {
                self.state.touch();
                let mut reset = self.streams.remove(&frame.stream_id).is_some();
                for emitter in self.emitters.iter().filter(|e| e.stream_id == frame.stream_id) {
                    emitter.cancelled.store(true, Ordering::Release);
                    reset = true;
                }
                if reset {
                    debug!(conn = self.state.id(), stream = frame.stream_id, "stream reset by peer");
                }
                Ok(())
            }
            FrameType::Goaway => {
                let goaway = GoawayFrame::decode(&frame)?;
                debug!(
                    conn = self.state.id(),
                    last_stream_id = goaway.last_stream_id,
                    "peer sent GOAWAY {}",
                    goaway.error_code
                );
                Ok(())
            }
            FrameType::PushPromise => Err(Error::Protocol("client sent PUSH_PROMISE".to_string())),
            FrameType::WindowUpdate | FrameType::Priority => Ok(()),
        }
    }

    fn on_settings(&mut self, frame: &Frame) -> Result<()> {
        if frame.stream_id != CONNECTION_STREAM_ID {
            return Err(Error::Protocol("SETTINGS on a stream".to_string()));
        }
        if frame.flags.is_ack() {
            return Ok(());
        }

        let settings = Settings::decode(&frame.payload)?;
        self.remote_settings.merge(&settings);
        self.sink.set_max_frame_size(self.remote_settings.get_max_frame_size());
        self.sink.send_settings_ack()
    }

    fn on_headers(&mut self, frame: &Frame) -> Result<()> {
        self.state.touch();

        let block = frame.header_block()?;
        let end_stream = frame.flags.is_end_stream();
        if frame.flags.is_end_headers() {
            return self.on_request(frame.stream_id, end_stream, &block);
        }

        self.pending_headers = Some(PendingHeaders {
            stream_id: frame.stream_id,
            end_stream,
            block: BytesMut::from(&block[..]),
        });
        Ok(())
    }

    fn on_continuation(&mut self, frame: &Frame) -> Result<()> {
        let Some(mut pending) = self.pending_headers.take() else {
            return Err(Error::Protocol("CONTINUATION without HEADERS".to_string()));
        };
        if pending.stream_id != frame.stream_id {
            return Err(Error::Protocol(format!(
                "CONTINUATION for stream {} while stream {} is open",
                frame.stream_id, pending.stream_id
            )));
        }

        pending.block.extend_from_slice(&frame.payload);
        if frame.flags.is_end_headers() {
            return self.on_request(pending.stream_id, pending.end_stream, &pending.block);
        }
        self.pending_headers = Some(pending);
        Ok(())
    }

    fn on_request(&mut self, stream_id: StreamId, end_stream: bool, block: &[u8]) -> Result<()> {
        // HPACK state must advance even for streams that end up refused
        let fields = self
            .decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;

        if stream_id == CONNECTION_STREAM_ID || stream_id % 2 == 0 {
            return Err(Error::Protocol(format!("invalid client stream id {}", stream_id)));
        }
        if stream_id <= self.highest_stream {
            // Trailers on an open stream
            if let Some(ctx) = self.streams.get_mut(&stream_id) {
                if end_stream {
                    strategy::on_half_close(&self.sink, ctx)?;
                    self.reap(stream_id);
                }
            }
            return Ok(());
        }
        self.highest_stream = stream_id;

        if !self.state.admit_stream(stream_id) {
            debug!(
                conn = self.state.id(),
                stream = stream_id,
                "refusing stream opened after GOAWAY"
            );
            return self.sink.send_rst_stream(stream_id, ErrorCode::RefusedStream);
        }

        let headers: HashMap<String, String> = fields
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).to_ascii_lowercase(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect();

        let route = router::route(
            headers.get(":method").map(String::as_str).unwrap_or(""),
            headers.get(":path").map(String::as_str).unwrap_or(""),
            headers.get("content-type").map(String::as_str),
        );
        let request_no = self.state.next_request();
        let mut ctx = StreamContext::new(stream_id, headers, route.mode());

        debug!(
            conn = self.state.id(),
            stream = stream_id,
            request = request_no,
            "{} {} -> {}",
            ctx.method(),
            ctx.path(),
            route.name()
        );

        if end_stream {
            ctx.close_remote();
        }

        match route {
            Route::Test | Route::NotFound => {
                strategy::respond_unary(&self.sink, &mut ctx, route, request_no)?;
            }
            Route::ServerStream => {
                // Finished emitters need no join
                self.emitters.retain(|e| !e.handle.is_finished());

                let cancelled = Arc::new(AtomicBool::new(false));
                let handle = strategy::spawn_server_stream(
                    self.sink.clone(),
                    Arc::clone(&self.state),
                    ctx,
                    self.stream_policy,
                    Arc::clone(&cancelled),
                )?;
                self.emitters.push(Emitter {
                    stream_id,
                    cancelled,
                    handle,
                });
                return Ok(());
            }
            Route::BidiStream => {
                strategy::open_bidi(&self.sink, &mut ctx)?;
            }
        }

        if !ctx.is_closed() {
            self.streams.insert(stream_id, ctx);
        }
        Ok(())
    }

    fn on_data(&mut self, frame: &Frame) -> Result<()> {
        self.state.touch();

        let data = frame.unpadded()?;
        let end_stream = frame.flags.is_end_stream();

        // Flow control counts the whole payload, padding included
        let consumed = frame.payload_len() as u32;
        if consumed > 0 {
            self.sink.send_window_update(CONNECTION_STREAM_ID, consumed)?;
            if !end_stream && self.streams.contains_key(&frame.stream_id) {
                self.sink.send_window_update(frame.stream_id, consumed)?;
            }
        }

        let Some(ctx) = self.streams.get_mut(&frame.stream_id) else {
            return Ok(());
        };

        if ctx.mode() == StreamMode::BidiStream {
            strategy::on_bidi_data(&self.sink, ctx, &data)?;
        }
        if end_stream {
            strategy::on_half_close(&self.sink, ctx)?;
        }

        self.reap(frame.stream_id);
        Ok(())
    }

    fn reap(&mut self, stream_id: StreamId) {
        if self.streams.get(&stream_id).is_some_and(StreamContext::is_closed) {
            self.streams.remove(&stream_id);
            trace!(conn = self.state.id(), stream = stream_id, "stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn state() -> ConnectionState {
        ConnectionState::new(1, SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    #[test]
    fn test_phase_is_monotonic() {
        let state = state();
        assert_eq!(state.phase(), Phase::Active);

        state.advance(Phase::Closing);
        assert_eq!(state.advance(Phase::GoawaySent), Phase::Closing);
        assert_eq!(state.phase(), Phase::Closing);
        assert!(state.is_closing());

        state.advance(Phase::Closed);
        assert_eq!(state.phase().name(), "CLOSED");
    }

    #[test]
    fn test_goaway_fires_once_and_freezes_activity() {
        let state = state();
        assert!(state.admit_stream(1));
        assert!(state.admit_stream(3));

        assert_eq!(state.try_begin_goaway(Duration::from_secs(60)), None);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(state.try_begin_goaway(Duration::from_millis(20)), Some(3));
        assert!(state.goaway_sent());
        assert_eq!(state.try_begin_goaway(Duration::ZERO), None);

        let idle = state.idle_for();
        assert!(!state.touch());
        assert!(state.idle_for() >= idle);

        // No stream gets past the announced last-stream-id
        assert!(!state.admit_stream(5));
        assert_eq!(state.last_stream_id(), 3);
    }

    #[test]
    fn test_touch_resets_idle_time() {
        let state = state();
        thread::sleep(Duration::from_millis(30));
        assert!(state.idle_for() >= Duration::from_millis(30));

        assert!(state.touch());
        assert!(state.idle_for() < Duration::from_millis(30));
    }

    #[test]
    fn test_single_watchdog_slot() {
        let state = state();
        assert!(state.arm_watchdog());
        assert!(!state.arm_watchdog());
    }

    #[test]
    fn test_request_counter() {
        let state = state();
        assert_eq!(state.next_request(), 1);
        assert_eq!(state.next_request(), 2);
        assert_eq!(state.requests(), 2);
    }
}
