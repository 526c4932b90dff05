//! Response strategy integration tests
//!
//! Unary, server-streaming and duplex echo responses as seen on the wire,
//! with idle timings long enough that no GOAWAY interferes.

mod helpers;

use helpers::{start_server, Probe, ProbeError};
use idle_goaway::config::IdlePolicy;
use idle_goaway::http::h2::frames::FrameFlags;
use idle_goaway::http::h2::{ErrorCode, FrameCodec, FrameType, Settings};
use idle_goaway::ndjson::StreamRecord;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
const NDJSON: (&str, &str) = ("content-type", "application/x-ndjson");

fn records(lines: &[String]) -> Vec<StreamRecord> {
    lines
        .iter()
        .map(|l| StreamRecord::parse(l).unwrap_or_else(|| panic!("not a record: {:?}", l)))
        .collect()
}

fn probe() -> (idle_goaway::http::h2::ServerHandle, Probe) {
    let server = start_server(IdlePolicy::default());
    let probe = Probe::connect(server.local_addr());
    (server, probe)
}

#[test]
fn test_unary_counts_requests_per_connection() {
    let (server, mut probe) = probe();

    for n in 1..=3 {
        let id = probe.request("GET", "/test", &[], true);
        let response = probe.response(id, WAIT).unwrap();
        let body = format!("OK from request #{}", n);

        assert_eq!(response.status(), Some(200));
        assert!(response.headers["content-type"].starts_with("text/plain"));
        assert_eq!(response.headers["content-length"], body.len().to_string());
        assert_eq!(response.body(), body);
    }

    // A second connection starts its own count
    let mut other = Probe::connect(server.local_addr());
    let id = other.request("GET", "/test?again=1", &[], true);
    assert_eq!(other.response(id, WAIT).unwrap().body(), "OK from request #1");
}

#[test]
fn test_unknown_route_is_404() {
    let (_server, mut probe) = probe();

    let id = probe.request("DELETE", "/nowhere", &[], true);
    let response = probe.response(id, WAIT).unwrap();
    assert_eq!(response.status(), Some(404));
    assert!(response.headers["content-type"].starts_with("text/plain"));
    assert_eq!(response.body(), "no route for DELETE /nowhere\n");

    // Without an ndjson content type POST /stream is not the echo route
    let id = probe.request("POST", "/stream", &[("content-type", "text/plain")], true);
    assert_eq!(probe.response(id, WAIT).unwrap().status(), Some(404));
}

#[test]
fn test_server_stream_sends_three_chunks() {
    let (_server, mut probe) = probe();

    let id = probe.request("GET", "/stream", &[], true);
    let response = probe.response(id, WAIT).unwrap();

    assert_eq!(response.status(), Some(200));
    assert_eq!(response.headers["content-type"], "application/x-ndjson");
    assert_eq!(response.data.len(), 3, "one DATA frame per chunk");
    assert_eq!(
        records(&response.lines()),
        (1..=3)
            .map(|chunk| StreamRecord::Chunk { chunk, total: 3 })
            .collect::<Vec<_>>()
    );
}

#[test]
fn test_server_stream_leaves_connection_responsive() {
    let (_server, mut probe) = probe();

    let stream = probe.request("GET", "/stream", &[], true);
    let unary = probe.request("GET", "/test", &[], true);

    // The unary answer overtakes the paced chunks
    let response = probe.response(unary, WAIT).unwrap();
    assert_eq!(response.body(), "OK from request #2");
    assert_eq!(records(&probe.response(stream, WAIT).unwrap().lines()).len(), 3);
}

#[test]
fn test_reset_server_stream_stops_chunks() {
    let (_server, mut probe) = probe();

    let id = probe.request("GET", "/stream", &[], true);
    probe
        .wait_frame(WAIT, |f| f.stream_id == id && f.frame_type == FrameType::Headers)
        .unwrap();
    probe.send_rst(id, ErrorCode::Cancel);

    // Chunks are 50ms apart; none may follow the reset
    let late = probe.wait_frame(Duration::from_millis(400), |f| {
        f.stream_id == id && f.frame_type == FrameType::Data
    });
    assert!(matches!(late, Err(ProbeError::Timeout)), "{:?}", late);

    let unary = probe.request("GET", "/test", &[], true);
    assert_eq!(probe.response(unary, WAIT).unwrap().body(), "OK from request #2");
}

#[test]
fn test_duplex_echo_then_done() {
    let (_server, mut probe) = probe();

    let id = probe.request("POST", "/stream", &[NDJSON], false);
    probe.send_data(id, b"{\"seq\":1}\n{\"se", false);
    probe.send_data(id, b"q\":2}\n", false);
    probe.send_data(id, b"", true);

    let response = probe.response(id, WAIT).unwrap();
    assert_eq!(response.status(), Some(200));
    assert_eq!(response.headers["content-type"], "application/x-ndjson");
    assert_eq!(
        records(&response.lines()),
        vec![
            StreamRecord::Echo { echo: 1 },
            StreamRecord::Echo { echo: 2 },
            StreamRecord::done(),
        ]
    );
}

#[test]
fn test_duplex_echoes_once_per_frame() {
    let (_server, mut probe) = probe();

    // Frame boundaries do not line up with record boundaries
    let id = probe.request("POST", "/stream", &[("Content-Type", "application/NDJSON")], false);
    probe.send_data(id, b"{\"seq\":1}", false);
    probe.send_data(id, b"{\"seq\":2}", false);
    probe.send_data(id, b"{\"seq\":3}\n{\"seq\":4}\n", false);
    probe.send_data(id, b"", true);

    let response = probe.response(id, WAIT).unwrap();
    assert_eq!(
        records(&response.lines()),
        vec![
            StreamRecord::Echo { echo: 1 },
            StreamRecord::Echo { echo: 2 },
            StreamRecord::Echo { echo: 3 },
            StreamRecord::done(),
        ]
    );
}

#[test]
fn test_duplex_final_frame_with_end_stream_is_echoed() {
    let (_server, mut probe) = probe();

    let id = probe.request("POST", "/stream", &[NDJSON], false);
    probe.send_data(id, b"{\"seq\":1}\n\n{\"seq\":2}", true);

    let response = probe.response(id, WAIT).unwrap();
    assert_eq!(
        records(&response.lines()),
        vec![StreamRecord::Echo { echo: 1 }, StreamRecord::done()]
    );
}

#[test]
fn test_duplex_without_body() {
    let (_server, mut probe) = probe();

    let id = probe.request("POST", "/stream", &[NDJSON], true);
    let response = probe.response(id, WAIT).unwrap();
    assert_eq!(records(&response.lines()), vec![StreamRecord::done()]);
}

#[test]
fn test_duplex_echoes_before_half_close() {
    let (_server, mut probe) = probe();

    let id = probe.request("POST", "/stream", &[NDJSON], false);
    probe.send_data(id, b"{\"seq\":1}\n", false);

    // The echo arrives while the request body is still open
    let echo = probe
        .wait_frame(WAIT, |f| f.stream_id == id && f.frame_type == FrameType::Data)
        .unwrap();
    let line = String::from_utf8_lossy(&echo.payload).into_owned();
    assert_eq!(StreamRecord::parse(line.trim()), Some(StreamRecord::Echo { echo: 1 }));
    assert!(!echo.flags.is_end_stream());

    probe.send_data(id, b"", true);
    let rest = probe.response(id, WAIT).unwrap();
    assert_eq!(records(&rest.lines()), vec![StreamRecord::done()]);
}

fn request_block() -> Vec<u8> {
    // Encoded on a fresh connection, so the server's HPACK table is empty too
    hpack::Encoder::new().encode(vec![
        (&b":method"[..], &b"GET"[..]),
        (&b":path"[..], &b"/test"[..]),
        (&b":scheme"[..], &b"https"[..]),
        (&b":authority"[..], &b"localhost"[..]),
    ])
}

fn flags(bits: &[u8]) -> FrameFlags {
    let mut flags = FrameFlags::empty();
    for bit in bits {
        flags.set(*bit);
    }
    flags
}

#[test]
fn test_headers_split_over_continuation() {
    let (_server, mut probe) = probe();

    let block = request_block();
    let (head, tail) = block.split_at(block.len() / 2);

    let mut wire = Vec::new();
    wire.extend_from_slice(&FrameCodec::encode_header(
        FrameType::Headers,
        flags(&[FrameFlags::END_STREAM]),
        1,
        head.len(),
    ));
    wire.extend_from_slice(head);
    wire.extend_from_slice(&FrameCodec::encode_header(
        FrameType::Continuation,
        flags(&[FrameFlags::END_HEADERS]),
        1,
        tail.len(),
    ));
    wire.extend_from_slice(tail);
    probe.send_raw(&wire);

    let response = probe.response(1, WAIT).unwrap();
    assert_eq!(response.body(), "OK from request #1");
}

#[test]
fn test_padded_headers() {
    let (_server, mut probe) = probe();

    let block = request_block();
    let mut payload = vec![4u8];
    payload.extend_from_slice(&block);
    payload.extend_from_slice(&[0; 4]);

    let mut wire = Vec::new();
    wire.extend_from_slice(&FrameCodec::encode_header(
        FrameType::Headers,
        flags(&[FrameFlags::END_STREAM, FrameFlags::END_HEADERS, FrameFlags::PADDED]),
        1,
        payload.len(),
    ));
    wire.extend_from_slice(&payload);
    probe.send_raw(&wire);

    let response = probe.response(1, WAIT).unwrap();
    assert_eq!(response.status(), Some(200));
}

/// DATA frame sizes of a 404 for a 20 KB path, on a connection advertising `settings`
fn long_not_found(settings: Settings) -> Vec<usize> {
    let server = start_server(IdlePolicy::default());
    let mut probe = Probe::connect_with_settings(server.local_addr(), settings);

    let path = format!("/{}", "x".repeat(20_000));
    let block = hpack::Encoder::new().encode(vec![
        (&b":method"[..], &b"GET"[..]),
        (&b":path"[..], path.as_bytes()),
        (&b":scheme"[..], &b"https"[..]),
        (&b":authority"[..], &b"localhost"[..]),
    ]);
    let (head, tail) = block.split_at(8192);

    let mut wire = Vec::new();
    wire.extend_from_slice(&FrameCodec::encode_header(
        FrameType::Headers,
        flags(&[FrameFlags::END_STREAM]),
        1,
        head.len(),
    ));
    wire.extend_from_slice(head);
    wire.extend_from_slice(&FrameCodec::encode_header(
        FrameType::Continuation,
        flags(&[FrameFlags::END_HEADERS]),
        1,
        tail.len(),
    ));
    wire.extend_from_slice(tail);
    probe.send_raw(&wire);

    let response = probe.response(1, WAIT).unwrap();
    assert_eq!(response.status(), Some(404));
    assert_eq!(response.body(), format!("no route for GET {}\n", path));
    response.data.iter().map(|d| d.len()).collect()
}

#[test]
fn test_data_frames_follow_peer_max_frame_size() {
    let frames = long_not_found(Settings::default());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], 16384);

    let larger = Settings {
        max_frame_size: Some(32768),
        ..Settings::default()
    };
    assert_eq!(long_not_found(larger).len(), 1);
}
