//! Stale-connection scenarios
//!
//! Every scenario has the same shape: warm a pooled connection up, leave it
//! idle long enough for the server to give up on it, then issue a follow-up
//! request and see whether the client recovers. Scenarios differ only in the
//! data of their `Scenario` descriptor; one generic runner executes them all.

pub mod client;
pub mod report;
pub mod runner;

pub use client::{ChunkLog, ClientError, ClientProfile, Exchange, HarnessClient, RetryPolicy};
pub use report::{Divergence, Format, Report};
pub use runner::{Runner, Target};

use crate::config::{IdlePolicy, RunnerConfig};
use crate::http::h2::{ServerEventKind, ServerEvents};
use crate::ndjson::StreamRecord;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// One request a scenario makes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSpec {
    /// `GET path`, read status and text body
    Unary { path: &'static str },
    /// `GET path`, read the streamed records
    ServerStream { path: &'static str },
    /// `POST /stream` with `lines` ndjson lines sent up front, one body
    /// chunk (and so one DATA frame) each
    Upload { lines: usize },
    /// `POST /stream` with a writer task feeding `lines` lines while the
    /// replies are read concurrently
    Duplex { lines: usize },
}

impl RequestSpec {
    pub fn describe(&self) -> String {
        match self {
            RequestSpec::Unary { path } => format!("GET {}", path),
            RequestSpec::ServerStream { path } => format!("GET {} (streamed)", path),
            RequestSpec::Upload { lines } => format!("POST /stream ({} lines)", lines),
            RequestSpec::Duplex { lines } => format!("POST /stream duplex ({} lines)", lines),
        }
    }
}

/// How long a scenario leaves the warmed-up connection alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleWait {
    /// Past the idle threshold: GOAWAY sent, socket still open
    PastGoaway,
    /// Past threshold and grace: socket force-closed
    PastClose,
}

impl IdleWait {
    /// Concrete wait against the server's idle policy
    pub fn duration(&self, idle: &IdlePolicy, slack: Duration) -> Duration {
        match self {
            IdleWait::PastGoaway => idle.threshold + slack,
            IdleWait::PastClose => idle.threshold + idle.grace + slack,
        }
    }

    /// Check the server did what the wait was meant to provoke
    pub fn precondition(&self, observed: &ServerObservation) -> Result<(), String> {
        if observed.goaways == 0 {
            return Err("server sent no GOAWAY during the idle wait".to_string());
        }
        if *self == IdleWait::PastClose && observed.sockets_closed == 0 {
            return Err("server did not close the TCP socket during the idle wait".to_string());
        }
        Ok(())
    }
}

/// What a follow-up must produce to pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// A unary response with this status and body prefix
    Unary { status: u16, body_prefix: &'static str },
    /// Exactly `count` chunk records
    Chunks { count: usize },
    /// Exactly `lines` echoes in order, then one terminal record
    Echo { lines: usize },
    /// At least `min_records` records, the terminal record last
    Duplex { min_records: usize },
}

impl Expectation {
    /// Compare an exchange against the expectation
    ///
    /// Returns a one-line summary on success and the mismatch on failure.
    pub fn check(&self, exchange: &Exchange) -> Result<String, String> {
        match self {
            Expectation::Unary { status, body_prefix } => {
                if exchange.status != *status {
                    return Err(format!("status {} (expected {})", exchange.status, status));
                }
                if !exchange.body.starts_with(body_prefix) {
                    return Err(format!("unexpected body {:?}", exchange.body));
                }
                Ok(format!("{} {:?}", exchange.status, exchange.body))
            }
            Expectation::Chunks { count } => {
                expect_ok(exchange)?;
                let chunks = exchange
                    .records
                    .iter()
                    .filter(|r| matches!(r, StreamRecord::Chunk { .. }))
                    .count();
                if chunks != *count || exchange.records.len() != *count {
                    return Err(format!(
                        "{} record(s), {} chunk(s) (expected {} chunks)",
                        exchange.records.len(),
                        chunks,
                        count
                    ));
                }
                Ok(format!("{} chunks", chunks))
            }
            Expectation::Echo { lines } => {
                expect_ok(exchange)?;
                let expected: Vec<StreamRecord> = (1..=*lines as u64)
                    .map(|echo| StreamRecord::Echo { echo })
                    .chain(std::iter::once(StreamRecord::done()))
                    .collect();
                if exchange.records != expected {
                    return Err(format!(
                        "{} record(s) {:?} (expected {} echoes then done)",
                        exchange.records.len(),
                        exchange.records,
                        lines
                    ));
                }
                Ok(format!("{} echoes + done", lines))
            }
            Expectation::Duplex { min_records } => {
                expect_ok(exchange)?;
                let records = &exchange.records;
                if records.len() < *min_records {
                    return Err(format!(
                        "{} record(s) (expected at least {})",
                        records.len(),
                        min_records
                    ));
                }
                if !records.last().is_some_and(StreamRecord::is_done) {
                    return Err(format!("stream ended without a terminal record: {:?}", records));
                }
                if records[..records.len() - 1].iter().any(StreamRecord::is_done) {
                    return Err("terminal record before the end of the stream".to_string());
                }
                Ok(format!(
                    "{} record(s), {} line(s) sent",
                    records.len(),
                    exchange.lines_sent
                ))
            }
        }
    }
}

fn expect_ok(exchange: &Exchange) -> Result<(), String> {
    if exchange.status != 200 {
        return Err(format!("status {} (expected 200)", exchange.status));
    }
    Ok(())
}

/// A stale-connection scenario
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub profile: ClientProfile,
    pub warmup: RequestSpec,
    pub idle: IdleWait,
    pub follow_up: RequestSpec,
    /// Bound on the follow-up, instead of the runner's timeout
    pub timeout: Option<Duration>,
    pub expect: Expectation,
}

/// The six canonical scenarios, in execution order
pub fn canonical(config: &RunnerConfig) -> Vec<Scenario> {
    let probing = ClientProfile::probing(config.probe_interval);
    let warmup = RequestSpec::Unary { path: "/test" };
    let unary_ok = Expectation::Unary {
        status: 200,
        body_prefix: "OK from request #",
    };

    vec![
        Scenario {
            name: "baseline-unary-retry",
            profile: probing.clone(),
            warmup: warmup.clone(),
            idle: IdleWait::PastGoaway,
            follow_up: RequestSpec::Unary { path: "/test" },
            timeout: None,
            expect: unary_ok.clone(),
        },
        Scenario {
            name: "server-stream-retry",
            profile: probing.clone(),
            warmup: warmup.clone(),
            idle: IdleWait::PastGoaway,
            follow_up: RequestSpec::ServerStream { path: "/stream" },
            timeout: None,
            expect: Expectation::Chunks { count: 3 },
        },
        Scenario {
            name: "streaming-post-retry",
            profile: probing.clone(),
            warmup: warmup.clone(),
            idle: IdleWait::PastGoaway,
            follow_up: RequestSpec::Upload { lines: 2 },
            timeout: None,
            expect: Expectation::Echo { lines: 2 },
        },
        Scenario {
            name: "no-liveness-probe",
            profile: ClientProfile::without_probe(),
            warmup: warmup.clone(),
            idle: IdleWait::PastGoaway,
            follow_up: RequestSpec::Unary { path: "/test" },
            timeout: None,
            expect: unary_ok.clone(),
        },
        Scenario {
            name: "post-tcp-close",
            profile: probing.clone(),
            warmup: warmup.clone(),
            idle: IdleWait::PastClose,
            follow_up: RequestSpec::Unary { path: "/test" },
            timeout: None,
            expect: unary_ok,
        },
        Scenario {
            name: "bidi-retry",
            profile: probing,
            warmup,
            idle: IdleWait::PastGoaway,
            follow_up: RequestSpec::Duplex { lines: 2 },
            timeout: None,
            expect: Expectation::Duplex { min_records: 1 },
        },
    ]
}

/// Keep the scenarios named in `only` (all of them if `only` is empty)
///
/// Unknown names are returned as the error.
pub fn select(scenarios: Vec<Scenario>, only: &[String]) -> Result<Vec<Scenario>, Vec<String>> {
    if only.is_empty() {
        return Ok(scenarios);
    }

    let unknown: Vec<String> = only
        .iter()
        .filter(|name| !scenarios.iter().any(|s| s.name == name.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(unknown);
    }

    Ok(scenarios
        .into_iter()
        .filter(|s| only.iter().any(|name| name == s.name))
        .collect())
}

/// Scenario classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    /// Expected data within the timeout
    Pass,
    /// Wrong data, wrong status or a client error
    Fail,
    /// Timeout elapsed without an answer
    Hung,
    /// The harness itself could not set the scenario up
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Hung => "HUNG",
            Outcome::Error => "ERROR",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What the server did between warm-up and follow-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerObservation {
    pub goaways: usize,
    pub sockets_closed: usize,
}

impl ServerObservation {
    /// Count events recorded since `mark`
    pub fn since(events: &ServerEvents, mark: usize) -> Self {
        let mut observed = ServerObservation::default();
        for event in events.since(mark) {
            match event.kind {
                ServerEventKind::GoawaySent { .. } => observed.goaways += 1,
                ServerEventKind::SocketClosed => observed.sockets_closed += 1,
                ServerEventKind::Accepted | ServerEventKind::Closed => {}
            }
        }
        observed
    }
}

/// Result of one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub outcome: Outcome,
    /// Follow-up duration
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub detail: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<ServerObservation>,
}

impl ScenarioResult {
    pub fn new(scenario: &str, outcome: Outcome, detail: impl Into<String>) -> Self {
        ScenarioResult {
            scenario: scenario.to_string(),
            outcome,
            elapsed: Duration::ZERO,
            detail: detail.into(),
            attempts: 0,
            observation: None,
        }
    }
}

fn as_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}
