//! idle-goaway - HTTP/2 idle-GOAWAY fault-injection harness
//!
//! This crate provides a small HTTP/2-over-TLS server that tears idle
//! connections down on a fixed schedule (GOAWAY, then a forced TCP close),
//! and a scenario runner that drives a real HTTP/2 client through
//! warm-up / idle / follow-up sequences to check that it recovers from the
//! stale connection instead of hanging.

pub mod config;
pub mod http;
pub mod ndjson;
pub mod scenario;
