//! Shared integration-test helpers
//!
//! `Probe` is a frame-level HTTP/2 client: it speaks raw frames over TLS so
//! tests can see exactly which GOAWAY, RST_STREAM and DATA frames the server
//! emits, and when the socket goes away.

#![allow(dead_code)]

use bytes::Bytes;
use idle_goaway::config::{IdlePolicy, ServerConfig, StreamPolicy};
use idle_goaway::http::h2::codec::FrameCodec;
use idle_goaway::http::h2::frames::{
    DataFrame, GoawayFrame, HeadersFrame, PingFrame, RstStreamFrame, SettingsFrame,
};
use idle_goaway::http::h2::{
    ErrorCode, Frame, FrameType, H2Server, ServerHandle, Settings, CONNECTION_PREFACE,
};
use idle_goaway::http::tls::{TlsConfig, TlsSessionOps};
use idle_goaway::http::SessionOps;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// How long a probe read blocks before checking its deadline
const READ_SLICE: Duration = Duration::from_millis(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idle_goaway=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Idle timings short enough for tests
pub fn fast_idle() -> IdlePolicy {
    IdlePolicy::default()
        .threshold(Duration::from_millis(400))
        .grace(Duration::from_millis(800))
        .poll_interval(Duration::from_millis(20))
}

pub fn fast_stream() -> StreamPolicy {
    StreamPolicy {
        chunks: 3,
        chunk_delay: Duration::from_millis(50),
    }
}

/// Start a server on a free loopback port
pub fn start_server(idle: IdlePolicy) -> ServerHandle {
    init_tracing();
    let config = ServerConfig::default()
        .port(0)
        .idle(idle)
        .stream(fast_stream());
    H2Server::bind(config)
        .expect("bind test server")
        .spawn()
        .expect("spawn test server")
}

/// Response collected from one stream
#[derive(Debug, Default)]
pub struct ProbeResponse {
    pub headers: HashMap<String, String>,
    pub data: Vec<Bytes>,
    pub reset: Option<ErrorCode>,
}

impl ProbeResponse {
    pub fn status(&self) -> Option<u16> {
        self.headers.get(":status").and_then(|s| s.parse().ok())
    }

    pub fn body(&self) -> String {
        let bytes: Vec<u8> = self.data.iter().flat_map(|d| d.iter().copied()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Non-empty body lines, in order
    pub fn lines(&self) -> Vec<String> {
        self.body()
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// What ended a wait on the connection
#[derive(Debug)]
pub enum ProbeError {
    Timeout,
    Closed,
    Protocol(String),
}

/// Frame-level HTTP/2 test client
pub struct Probe {
    session: TlsSessionOps,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    next_stream: u32,
    /// GOAWAY frames seen so far, in arrival order
    pub goaways: Vec<GoawayFrame>,
    /// PING ACK payloads seen so far
    pub ping_acks: Vec<[u8; 8]>,
    /// Frames read while waiting for something else
    backlog: Vec<Frame>,
}

impl Probe {
    /// Connect, negotiate `h2` and finish the SETTINGS exchange
    pub fn connect(addr: SocketAddr) -> Probe {
        Self::connect_with_alpn(addr, &["h2"]).expect("h2 connection")
    }

    pub fn connect_with_alpn(addr: SocketAddr, alpn: &[&str]) -> Result<Probe, String> {
        Self::open(addr, alpn, Settings::default())
    }

    /// Connect advertising `settings` instead of the defaults
    pub fn connect_with_settings(addr: SocketAddr, settings: Settings) -> Probe {
        Self::open(addr, &["h2"], settings).expect("h2 connection")
    }

    fn open(addr: SocketAddr, alpn: &[&str], settings: Settings) -> Result<Probe, String> {
        let tcp = TcpStream::connect(addr).map_err(|e| e.to_string())?;
        tcp.set_read_timeout(Some(READ_SLICE))
            .map_err(|e| e.to_string())?;

        let tls = TlsConfig::client()
            .and_then(|b| b.alpn(alpn))
            .map(|b| b.servername("localhost"))
            .and_then(|b| b.build())
            .map_err(|e| e.to_string())?;
        let session = tls.connect(tcp).map_err(|e| e.to_string())?;

        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(settings.get_max_frame_size() as usize);

        let mut probe = Probe {
            session,
            codec,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            next_stream: 1,
            goaways: Vec::new(),
            ping_acks: Vec::new(),
            backlog: Vec::new(),
        };

        probe.write(CONNECTION_PREFACE);
        probe.write(&FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)));

        let settings = probe
            .wait_frame(Duration::from_secs(5), |f| {
                f.frame_type == FrameType::Settings && !f.flags.is_ack()
            })
            .map_err(|e| format!("no server SETTINGS: {:?}", e))?;
        assert_eq!(settings.stream_id, 0);
        probe.write(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));

        Ok(probe)
    }

    pub fn alpn(&self) -> Option<String> {
        self.session.vars().alpn.clone()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.session.write_all(bytes).expect("probe write");
    }

    /// Write, reporting failure instead of panicking
    pub fn try_write(&mut self, bytes: &[u8]) -> bool {
        self.session.write_all(bytes).is_ok()
    }

    fn encode_request(&mut self, method: &str, path: &str, extra: &[(&str, &str)], end_stream: bool) -> (u32, Vec<u8>) {
        let id = self.next_stream;
        self.next_stream += 2;

        let mut headers: Vec<(&[u8], &[u8])> = vec![
            (&b":method"[..], method.as_bytes()),
            (&b":path"[..], path.as_bytes()),
            (&b":scheme"[..], &b"https"[..]),
            (&b":authority"[..], &b"localhost"[..]),
        ];
        headers.extend(extra.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));

        let block = self.encoder.encode(headers);
        let frame = HeadersFrame::new(id, Bytes::from(block), end_stream, true);
        (id, FrameCodec::encode_headers_frame(&frame).to_vec())
    }

    /// Open a stream with `method path`; returns its id
    pub fn request(&mut self, method: &str, path: &str, extra: &[(&str, &str)], end_stream: bool) -> u32 {
        let (id, wire) = self.encode_request(method, path, extra, end_stream);
        self.write(&wire);
        id
    }

    /// Send a complete `method path` request; false once the connection is gone
    pub fn try_request(&mut self, method: &str, path: &str) -> bool {
        let (_, wire) = self.encode_request(method, path, &[], true);
        self.try_write(&wire)
    }

    pub fn send_data(&mut self, id: u32, data: &[u8], end_stream: bool) {
        let frame = DataFrame::new(id, Bytes::copy_from_slice(data), end_stream);
        self.write(&FrameCodec::encode_data_frame(&frame));
    }

    pub fn send_ping(&mut self, data: [u8; 8]) {
        self.write(&FrameCodec::encode_ping_frame(&PingFrame::new(data)));
    }

    pub fn send_rst(&mut self, id: u32, error_code: ErrorCode) {
        let frame = RstStreamFrame {
            stream_id: id,
            error_code,
        };
        self.write(&FrameCodec::encode_rst_stream_frame(&frame));
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.write(bytes);
    }

    /// Next frame off the wire, noting connection-level frames on the way
    fn next_frame(&mut self, deadline: Instant) -> Result<Frame, ProbeError> {
        loop {
            match self.codec.decode() {
                Ok(Some(frame)) => {
                    match frame.frame_type {
                        FrameType::Goaway => {
                            if let Ok(goaway) = GoawayFrame::decode(&frame) {
                                self.goaways.push(goaway);
                            }
                        }
                        FrameType::Ping if frame.flags.is_ack() => {
                            if let Ok(ping) = PingFrame::decode(&frame) {
                                self.ping_acks.push(ping.data);
                            }
                        }
                        _ => {}
                    }
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => return Err(ProbeError::Protocol(e.to_string())),
            }

            if Instant::now() >= deadline {
                return Err(ProbeError::Timeout);
            }

            let mut buf = [0u8; 16384];
            match self.session.read(&mut buf) {
                Ok(0) => return Err(ProbeError::Closed),
                Ok(n) => self.codec.feed(&buf[..n]),
                Err(e) if e.is_would_block() => {}
                Err(_) => return Err(ProbeError::Closed),
            }
        }
    }

    /// Wait for the first frame matching `pred`; others go to the backlog
    pub fn wait_frame<F>(&mut self, timeout: Duration, pred: F) -> Result<Frame, ProbeError>
    where
        F: Fn(&Frame) -> bool,
    {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return Ok(self.backlog.remove(pos));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let frame = self.next_frame(deadline)?;
            if pred(&frame) {
                return Ok(frame);
            }
            self.backlog.push(frame);
        }
    }

    /// Wait for a GOAWAY; returns the first one received
    pub fn wait_goaway(&mut self, timeout: Duration) -> Result<GoawayFrame, ProbeError> {
        if let Some(goaway) = self.goaways.first() {
            return Ok(goaway.clone());
        }
        let frame = self.wait_frame(timeout, |f| f.frame_type == FrameType::Goaway)?;
        GoawayFrame::decode(&frame).map_err(|e| ProbeError::Protocol(e.to_string()))
    }

    /// Read until the server drops the connection; returns how long it took
    pub fn wait_closed(&mut self, timeout: Duration) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            match self.next_frame(deadline) {
                Ok(frame) => self.backlog.push(frame),
                Err(ProbeError::Closed) => return Ok(started.elapsed()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Collect one stream's response until END_STREAM or RST_STREAM
    pub fn response(&mut self, id: u32, timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        let mut response = ProbeResponse::default();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.wait_frame(remaining, |f| f.stream_id == id)?;

            match frame.frame_type {
                FrameType::Headers => {
                    let block = frame
                        .header_block()
                        .map_err(|e| ProbeError::Protocol(e.to_string()))?;
                    let decoded = self
                        .decoder
                        .decode(&block)
                        .map_err(|e| ProbeError::Protocol(format!("{:?}", e)))?;
                    for (name, value) in decoded {
                        response.headers.insert(
                            String::from_utf8_lossy(&name).into_owned(),
                            String::from_utf8_lossy(&value).into_owned(),
                        );
                    }
                }
                FrameType::Data => {
                    if !frame.payload.is_empty() {
                        response.data.push(frame.payload.clone());
                    }
                }
                FrameType::RstStream => {
                    let code = u32::from_be_bytes([
                        frame.payload[0],
                        frame.payload[1],
                        frame.payload[2],
                        frame.payload[3],
                    ]);
                    response.reset = ErrorCode::from_u32(code);
                    return Ok(response);
                }
                _ => {}
            }

            if frame.flags.is_end_stream() {
                return Ok(response);
            }
        }
    }
}
