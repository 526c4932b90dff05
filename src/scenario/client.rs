//! Adapter around the HTTP client under test
//!
//! The harness only talks to `reqwest` through this module: unary requests,
//! streaming responses, streaming uploads and full-duplex exchanges, plus the
//! pooling, keep-alive and retry knobs a scenario's `ClientProfile` selects.

use super::RequestSpec;
use crate::ndjson::{LineBuffer, StreamRecord};
use bytes::Bytes;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Client-side failures
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to build client: {}", chain(.0))]
    Build(#[source] reqwest::Error),

    #[error("request failed after {attempts} attempt(s): {}", chain(.source))]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("response body failed: {}", chain(.0))]
    Body(#[source] reqwest::Error),

    #[error("request writer stopped: {0}")]
    Writer(String),
}

/// Flatten an error and its sources into one line
pub fn chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

/// Bounded retries on transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Pause before each retry
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Whether `err` from attempt number `attempt` deserves another try
    ///
    /// Only failures to get a response (connect, send, refused stream) are
    /// retried; a response that fails halfway is reported as is.
    pub fn should_retry(&self, err: &reqwest::Error, attempt: u32) -> bool {
        attempt < self.max_attempts && (err.is_connect() || err.is_request())
    }
}

/// How the client under test is configured for one scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    /// HTTP/2 keep-alive PING interval; `None` disables liveness probing
    pub liveness_probe: Option<Duration>,
    /// How long an idle pooled connection is kept
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
    pub retry: RetryPolicy,
}

impl ClientProfile {
    /// Pooled client that probes liveness every `interval`
    pub fn probing(interval: Duration) -> Self {
        ClientProfile {
            liveness_probe: Some(interval),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 1,
            retry: RetryPolicy::default(),
        }
    }

    /// Pooled client that never sends keep-alive PINGs
    pub fn without_probe() -> Self {
        ClientProfile {
            liveness_probe: None,
            ..Self::probing(Duration::ZERO)
        }
    }
}

/// Append-only record log shared between a reader and the assertions
#[derive(Debug, Clone, Default)]
pub struct ChunkLog {
    inner: Arc<Mutex<Vec<StreamRecord>>>,
}

impl ChunkLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<StreamRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: StreamRecord) {
        self.entries().push(record);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self) -> Vec<StreamRecord> {
        self.entries().clone()
    }
}

/// What one exchange produced
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub status: u16,
    /// Text body of unary responses
    pub body: String,
    /// Records of streaming responses, in arrival order
    pub records: Vec<StreamRecord>,
    /// Response lines that were not records
    pub stray_lines: usize,
    /// Request lines the writer delivered
    pub lines_sent: usize,
    /// Attempts it took to get a response
    pub attempts: u32,
}

/// Writer task feeding a streaming request body
///
/// Aborted when dropped, so a timed-out or retried exchange leaves nothing
/// running behind it.
struct BodyWriter {
    task: Option<JoinHandle<Result<usize, ClientError>>>,
}

impl BodyWriter {
    /// Body whose lines are fed one by one, `gap` apart, from a separate task
    fn spawn(lines: Vec<Bytes>, gap: Duration) -> (reqwest::Body, Self) {
        let (tx, rx) = mpsc::channel::<Bytes>(4);

        let task = tokio::spawn(async move {
            let mut sent = 0;
            for line in lines {
                tokio::time::sleep(gap).await;
                tx.send(line)
                    .await
                    .map_err(|_| ClientError::Writer(format!("body closed after {} line(s)", sent)))?;
                sent += 1;
            }
            // Dropping the sender ends the request body
            Ok(sent)
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (Ok::<_, std::io::Error>(line), rx))
        });

        (reqwest::Body::wrap_stream(stream), BodyWriter { task: Some(task) })
    }

    async fn finish(mut self) -> Result<usize, ClientError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| ClientError::Writer(e.to_string()))?,
            None => Ok(0),
        }
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Request lines sent by upload and duplex exchanges
pub fn request_lines(count: usize) -> Vec<Bytes> {
    (1..=count)
        .map(|seq| {
            let line = serde_json::json!({ "seq": seq, "msg": format!("line {}", seq) });
            Bytes::from(format!("{}\n", line))
        })
        .collect()
}

/// The client under test, configured for one scenario
pub struct HarnessClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    write_gap: Duration,
}

impl HarnessClient {
    /// Build a fresh client (fresh connection pool) for `base_url`
    pub fn new(
        base_url: impl Into<String>,
        profile: &ClientProfile,
        write_gap: Duration,
    ) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .http2_prior_knowledge()
            .danger_accept_invalid_certs(true)
            .pool_idle_timeout(profile.pool_idle_timeout)
            .pool_max_idle_per_host(profile.pool_max_idle_per_host);

        builder = match profile.liveness_probe {
            Some(interval) => builder
                .http2_keep_alive_interval(interval)
                .http2_keep_alive_timeout(interval * 2)
                .http2_keep_alive_while_idle(true),
            None => builder.http2_keep_alive_interval(None::<Duration>),
        };

        Ok(HarnessClient {
            client: builder.build().map_err(ClientError::Build)?,
            base_url: base_url.into(),
            retry: profile.retry,
            write_gap,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Perform one exchange; streamed records are appended to `log` as they arrive
    pub async fn execute(&self, spec: &RequestSpec, log: &ChunkLog) -> Result<Exchange, ClientError> {
        match spec {
            RequestSpec::Unary { path } => self.unary(path).await,
            RequestSpec::ServerStream { path } => self.server_stream(path, log).await,
            RequestSpec::Upload { lines } => self.upload(*lines, log).await,
            RequestSpec::Duplex { lines } => self.duplex(*lines, log).await,
        }
    }

    async fn send<F>(&self, mut make: F) -> Result<(reqwest::Response, u32, Option<BodyWriter>), ClientError>
    where
        F: FnMut() -> (reqwest::RequestBuilder, Option<BodyWriter>),
    {
        let mut attempt = 1;
        loop {
            let (request, writer) = make();
            match request.send().await {
                Ok(response) => return Ok((response, attempt, writer)),
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    debug!(attempt, "retrying after transport error: {}", chain(&e));
                    drop(writer);
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ClientError::Transport {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    async fn unary(&self, path: &str) -> Result<Exchange, ClientError> {
        let url = self.url(path);
        let (response, attempts, _) = self.send(|| (self.client.get(&url), None)).await?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(ClientError::Body)?;
        Ok(Exchange {
            status,
            body,
            attempts,
            ..Exchange::default()
        })
    }

    async fn server_stream(&self, path: &str, log: &ChunkLog) -> Result<Exchange, ClientError> {
        let url = self.url(path);
        let (response, attempts, _) = self.send(|| (self.client.get(&url), None)).await?;

        let mut exchange = read_records(response, log).await?;
        exchange.attempts = attempts;
        Ok(exchange)
    }

    /// Stream the request body up front, then read the replies
    async fn upload(&self, lines: usize, log: &ChunkLog) -> Result<Exchange, ClientError> {
        let url = self.url("/stream");
        let (response, attempts, _) = self
            .send(|| {
                let chunks = request_lines(lines).into_iter().map(Ok::<_, std::io::Error>);
                let body = reqwest::Body::wrap_stream(futures_util::stream::iter(chunks));
                (self.ndjson_post(&url).body(body), None)
            })
            .await?;

        let mut exchange = read_records(response, log).await?;
        exchange.attempts = attempts;
        exchange.lines_sent = lines;
        Ok(exchange)
    }

    /// Feed the body from a writer task while this task reads the replies
    async fn duplex(&self, lines: usize, log: &ChunkLog) -> Result<Exchange, ClientError> {
        let url = self.url("/stream");
        let gap = self.write_gap;
        let (response, attempts, writer) = self
            .send(|| {
                let (body, writer) = BodyWriter::spawn(request_lines(lines), gap);
                (self.ndjson_post(&url).body(body), Some(writer))
            })
            .await?;

        let mut exchange = read_records(response, log).await?;
        exchange.attempts = attempts;
        if let Some(writer) = writer {
            exchange.lines_sent = writer.finish().await?;
        }
        Ok(exchange)
    }

    fn ndjson_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
    }
}

/// Read a streaming response to its end, splitting it back into records
async fn read_records(mut response: reqwest::Response, log: &ChunkLog) -> Result<Exchange, ClientError> {
    let status = response.status().as_u16();
    let mut lines = LineBuffer::new();
    let mut exchange = Exchange {
        status,
        ..Exchange::default()
    };

    while let Some(chunk) = response.chunk().await.map_err(ClientError::Body)? {
        for line in lines.push(&chunk) {
            take_line(&line, &mut exchange, log);
        }
    }
    if let Some(line) = lines.finish() {
        take_line(&line, &mut exchange, log);
    }

    Ok(exchange)
}

fn take_line(line: &str, exchange: &mut Exchange, log: &ChunkLog) {
    match StreamRecord::parse(line) {
        Some(record) => {
            log.push(record.clone());
            exchange.records.push(record);
        }
        None => exchange.stray_lines += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        let probing = ClientProfile::probing(Duration::from_secs(1));
        assert_eq!(probing.liveness_probe, Some(Duration::from_secs(1)));
        assert_eq!(probing.retry.max_attempts, 3);

        let silent = ClientProfile::without_probe();
        assert_eq!(silent.liveness_probe, None);
        assert_eq!(silent.pool_max_idle_per_host, probing.pool_max_idle_per_host);
    }

    #[test]
    fn test_request_lines() {
        let lines = request_lines(2);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.ends_with(b"\n")));
        assert_eq!(lines.iter().filter(|l| l.contains(&b'\n')).count(), 2);

        let first: serde_json::Value = serde_json::from_slice(&lines[0]).unwrap();
        assert_eq!(first["seq"], 1);
    }

    #[test]
    fn test_chunk_log_shared_between_clones() {
        let log = ChunkLog::new();
        let reader = log.clone();
        assert!(reader.is_empty());

        log.push(StreamRecord::Echo { echo: 1 });
        log.push(StreamRecord::done());

        assert_eq!(reader.len(), 2);
        assert!(reader.snapshot()[1].is_done());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("exchange aborted")]
    struct Aborted(#[source] std::io::Error);

    #[test]
    fn test_error_chain() {
        let err = Aborted(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert_eq!(chain(&err), "exchange aborted: reset by peer");
    }

    #[tokio::test]
    async fn test_body_writer_counts_lines() {
        let (body, writer) = BodyWriter::spawn(request_lines(3), Duration::from_millis(1));
        assert_eq!(writer.finish().await.unwrap(), 3);
        drop(body);
    }

    #[tokio::test]
    async fn test_body_writer_stops_when_body_dropped() {
        let (body, writer) = BodyWriter::spawn(request_lines(2), Duration::from_millis(20));
        drop(body);
        assert!(matches!(writer.finish().await, Err(ClientError::Writer(_))));
    }
}
