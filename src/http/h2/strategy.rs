//! Response strategies
//!
//! - Unary: one response with a text body (`/test` and the 404 fallback).
//! - Server-streaming: headers at once, then a fixed number of ndjson chunks
//!   sent from a dedicated emitter thread.
//! - Bidirectional: headers at once, one echo per inbound DATA frame, and a single
//!   terminal record once the peer half-closes.

use super::connection::{ConnectionState, FrameSink};
use super::error::{Error, Result};
use super::router::Route;
use super::stream::{StreamContext, StreamMode};
use crate::config::StreamPolicy;
use crate::ndjson::StreamRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Content type of `/stream` responses
pub const NDJSON: &str = "application/x-ndjson";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

fn line(record: &StreamRecord) -> Result<Vec<u8>> {
    record
        .to_line()
        .map_err(|e| Error::Internal(format!("ndjson encode error: {}", e)))
}

/// Answer a unary route with a complete response
pub fn respond_unary(
    sink: &FrameSink,
    ctx: &mut StreamContext,
    route: Route,
    request_no: u64,
) -> Result<()> {
    let (status, body) = match route {
        Route::Test => (200, format!("OK from request #{}", request_no)),
        _ => (404, format!("no route for {} {}\n", ctx.method(), ctx.path())),
    };
    let length = body.len().to_string();

    sink.send_response(
        ctx.id(),
        status,
        &[("content-type", TEXT_PLAIN), ("content-length", &length)],
        Some(body.as_bytes()),
        true,
    )?;
    ctx.close_local();
    Ok(())
}

/// Send the response headers and hand the stream to an emitter thread
///
/// The read loop returns to serving PING and SETTINGS while the chunks are
/// being paced out. Raising `cancelled` (the peer reset the stream) stops the
/// emitter before its next chunk.
pub fn spawn_server_stream(
    sink: FrameSink,
    state: Arc<ConnectionState>,
    mut ctx: StreamContext,
    policy: StreamPolicy,
    cancelled: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    sink.send_response(ctx.id(), 200, &[("content-type", NDJSON)], None, false)?;

    let name = format!("emit-{}-{}", state.id(), ctx.id());
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Err(e) = emit_chunks(&sink, &state, &mut ctx, policy, &cancelled) {
                warn!(conn = state.id(), stream = ctx.id(), "chunk emission failed: {}", e);
            }
        })
        .map_err(|e| Error::Internal(format!("failed to spawn emitter: {}", e)))?;
    Ok(handle)
}

fn emit_chunks(
    sink: &FrameSink,
    state: &ConnectionState,
    ctx: &mut StreamContext,
    policy: StreamPolicy,
    cancelled: &AtomicBool,
) -> Result<()> {
    if policy.chunks == 0 {
        sink.send_data(ctx.id(), &[], true)?;
        ctx.close_local();
        return Ok(());
    }

    while ctx.chunks() < policy.chunks {
        thread::sleep(policy.chunk_delay);
        if state.is_closing() {
            debug!(
                conn = state.id(),
                stream = ctx.id(),
                sent = ctx.chunks(),
                "connection closing, abandoning stream"
            );
            return Ok(());
        }
        if cancelled.load(Ordering::Acquire) {
            debug!(
                conn = state.id(),
                stream = ctx.id(),
                sent = ctx.chunks(),
                "stream reset by peer, stopping"
            );
            return Ok(());
        }

        let n = ctx.next_chunk();
        let record = StreamRecord::Chunk {
            chunk: n,
            total: policy.chunks,
        };
        sink.send_data(ctx.id(), &line(&record)?, n == policy.chunks)?;
    }

    ctx.close_local();
    debug!(conn = state.id(), stream = ctx.id(), chunks = ctx.chunks(), "stream complete");
    Ok(())
}

/// Send the duplex response headers before any request body arrives
///
/// A request that ended with its headers gets the terminal record at once.
pub fn open_bidi(sink: &FrameSink, ctx: &mut StreamContext) -> Result<()> {
    sink.send_response(ctx.id(), 200, &[("content-type", NDJSON)], None, false)?;

    if ctx.remote_closed() {
        finish_bidi(sink, ctx)?;
    }
    Ok(())
}

/// Echo one inbound DATA frame
///
/// The reply numbers the frame, not its content: a frame carrying half a
/// line or several lines still gets exactly one echo.
pub fn on_bidi_data(sink: &FrameSink, ctx: &mut StreamContext, data: &[u8]) -> Result<()> {
    match ctx.receive_data(data) {
        Some(n) => echo(sink, ctx, n),
        None => Ok(()),
    }
}

/// React to the peer's END_STREAM
pub fn on_half_close(sink: &FrameSink, ctx: &mut StreamContext) -> Result<()> {
    if ctx.remote_closed() {
        return Ok(());
    }

    ctx.close_remote();
    if ctx.mode() == StreamMode::BidiStream && !ctx.local_closed() {
        finish_bidi(sink, ctx)?;
    }
    Ok(())
}

fn echo(sink: &FrameSink, ctx: &mut StreamContext, n: u32) -> Result<()> {
    ctx.next_chunk();
    sink.send_data(ctx.id(), &line(&StreamRecord::Echo { echo: u64::from(n) })?, false)
}

fn finish_bidi(sink: &FrameSink, ctx: &mut StreamContext) -> Result<()> {
    sink.send_data(ctx.id(), &line(&StreamRecord::done())?, true)?;
    ctx.close_local();
    Ok(())
}
