//! HTTP/2 wire-path benchmarks
//!
//! Measures the pieces every request goes through on the server:
//! - Frame header encoding/decoding
//! - DATA frame encoding
//! - Streaming frame decode from a byte feed (preface included)
//! - SETTINGS encode/decode
//! - HPACK response header encoding
//! - ndjson line reassembly
//!
//! Run with: cargo bench --bench h2_performance

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use idle_goaway::http::h2::{
    codec::FrameCodec,
    frames::{DataFrame, FrameFlags, FrameType, HeadersFrame, SettingsFrame},
    settings::Settings,
    CONNECTION_PREFACE,
};
use idle_goaway::ndjson::{LineBuffer, StreamRecord};

fn bench_frame_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_header");

    group.bench_function("encode_data_header", |b| {
        b.iter(|| {
            let header = FrameCodec::encode_header(
                black_box(FrameType::Data),
                black_box(FrameFlags::from_u8(FrameFlags::END_STREAM)),
                black_box(1),
                black_box(1024),
            );
            black_box(header);
        });
    });

    let encoded = FrameCodec::encode_header(FrameType::Headers, FrameFlags::from_u8(0x05), 1, 4096);
    group.bench_function("decode_headers_header", |b| {
        b.iter(|| black_box(FrameCodec::decode_header(black_box(&encoded))));
    });

    group.finish();
}

fn bench_data_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame_encode");

    for size in [64usize, 1024, 16384] {
        let data = Bytes::from(vec![b'x'; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                let frame = DataFrame::new(1, data.clone(), false);
                black_box(FrameCodec::encode_data_frame(black_box(&frame)));
            });
        });
    }

    group.finish();
}

fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decode");

    // A connection's opening bytes: preface, SETTINGS, then HEADERS + DATA pairs
    let mut wire = Vec::from(CONNECTION_PREFACE);
    wire.extend_from_slice(&FrameCodec::encode_settings_frame(
        &SettingsFrame::new(Settings::server_initial()),
    ));
    let line = StreamRecord::Echo { echo: 1 }.to_line().unwrap_or_default();
    for n in 0..50u32 {
        let id = 2 * n + 1;
        let headers = HeadersFrame::new(id, Bytes::from_static(&[0x82, 0x87, 0x84]), false, true);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&headers));
        let data = DataFrame::new(id, Bytes::from(line.clone()), true);
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&data));
    }
    group.throughput(Throughput::Bytes(wire.len() as u64));

    for chunk in [64usize, 1500, 16384] {
        group.bench_with_input(BenchmarkId::new("feed", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut codec = FrameCodec::with_preface();
                let mut frames = 0;
                for piece in wire.chunks(chunk) {
                    codec.feed(piece);
                    while let Ok(Some(frame)) = codec.decode() {
                        black_box(&frame);
                        frames += 1;
                    }
                }
                assert_eq!(frames, 101);
            });
        });
    }

    group.finish();
}

fn bench_settings(c: &mut Criterion) {
    let mut group = c.benchmark_group("settings");
    let settings = Settings::server_initial();
    let payload = settings.encode();

    group.bench_function("encode", |b| b.iter(|| black_box(black_box(&settings).encode())));
    group.bench_function("decode", |b| {
        b.iter(|| black_box(Settings::decode(black_box(&payload))))
    });

    group.finish();
}

fn bench_hpack_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack_response");
    let headers: Vec<(&[u8], &[u8])> = vec![
        (&b":status"[..], &b"200"[..]),
        (&b"content-type"[..], &b"text/plain; charset=utf-8"[..]),
        (&b"content-length"[..], &b"18"[..]),
    ];

    // Encoder state carries over between responses, as on a live connection
    group.bench_function("encode_warm", |b| {
        let mut encoder = hpack::Encoder::new();
        b.iter(|| black_box(encoder.encode(headers.iter().copied())));
    });

    group.bench_function("encode_cold", |b| {
        b.iter(|| black_box(hpack::Encoder::new().encode(headers.iter().copied())));
    });

    group.finish();
}

fn bench_ndjson_lines(c: &mut Criterion) {
    let mut group = c.benchmark_group("ndjson_lines");
    let body: Vec<u8> = (1..=100u64)
        .flat_map(|echo| StreamRecord::Echo { echo }.to_line().unwrap_or_default())
        .collect();
    group.throughput(Throughput::Bytes(body.len() as u64));

    for chunk in [7usize, 512] {
        group.bench_with_input(BenchmarkId::new("push", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut lines = LineBuffer::new();
                let mut count = 0;
                for piece in body.chunks(chunk) {
                    count += lines.push(piece).len();
                }
                assert_eq!(count, 100);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_header,
    bench_data_frame_encode,
    bench_stream_decode,
    bench_settings,
    bench_hpack_response,
    bench_ndjson_lines
);
criterion_main!(benches);
