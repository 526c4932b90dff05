//! Generic scenario runner
//!
//! Executes one `Scenario` at a time: warm-up, idle wait, follow-up under a
//! bounded timeout, classification. Nothing a scenario does can abort the
//! suite; every failure ends up in its `ScenarioResult`.

use super::client::{ChunkLog, ClientError, HarnessClient};
use super::{Exchange, Expectation, Outcome, Scenario, ScenarioResult, ServerObservation};
use crate::config::{IdlePolicy, RunnerConfig};
use crate::http::h2::{ServerEvents, ServerHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The server a run is aimed at
#[derive(Debug, Clone)]
pub struct Target {
    /// `https://localhost:<port>`
    pub base_url: String,
    /// Lifecycle events of the server behind `base_url`
    pub events: ServerEvents,
}

impl Target {
    pub fn new(base_url: impl Into<String>, events: ServerEvents) -> Self {
        Target {
            base_url: base_url.into(),
            events,
        }
    }

    pub fn from_handle(handle: &ServerHandle) -> Self {
        Target::new(handle.url(""), handle.events().clone())
    }
}

/// Runs scenarios against a server with a known idle policy
#[derive(Debug, Clone)]
pub struct Runner {
    config: RunnerConfig,
    idle: IdlePolicy,
}

impl Runner {
    pub fn new(config: RunnerConfig, idle: IdlePolicy) -> Self {
        Runner { config, idle }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `scenarios` strictly one after another, settling in between
    pub async fn run_all(&self, scenarios: &[Scenario], target: &Target) -> Vec<ScenarioResult> {
        let mut results = Vec::with_capacity(scenarios.len());
        for (i, scenario) in scenarios.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.settle).await;
            }
            results.push(self.run(scenario, target).await);
        }
        results
    }

    /// Run one scenario and classify it
    pub async fn run(&self, scenario: &Scenario, target: &Target) -> ScenarioResult {
        let name = scenario.name;
        info!(scenario = name, follow_up = %scenario.follow_up.describe(), "scenario starting");

        let client = match HarnessClient::new(&target.base_url, &scenario.profile, self.config.write_gap) {
            Ok(client) => client,
            Err(e) => return self.setup_failed(name, e.to_string(), None),
        };
        let mark = target.events.mark();

        let warmup = tokio::time::timeout(
            self.config.timeout,
            client.execute(&scenario.warmup, &ChunkLog::new()),
        )
        .await;
        match warmup {
            Ok(Ok(exchange)) if exchange.status == 200 => {
                debug!(scenario = name, attempts = exchange.attempts, "warm-up done");
            }
            Ok(Ok(exchange)) => {
                let detail = format!("warm-up returned status {}", exchange.status);
                return self.setup_failed(name, detail, None);
            }
            Ok(Err(e)) => return self.setup_failed(name, format!("warm-up failed: {}", e), None),
            Err(_) => {
                let detail = format!("warm-up timed out after {}ms", self.config.timeout.as_millis());
                return self.setup_failed(name, detail, None);
            }
        }

        let wait = scenario.idle.duration(&self.idle, self.config.slack);
        debug!(scenario = name, wait_ms = wait.as_millis() as u64, "idling");
        tokio::time::sleep(wait).await;

        let observed = ServerObservation::since(&target.events, mark);
        if let Err(reason) = scenario.idle.precondition(&observed) {
            return self.setup_failed(name, reason, Some(observed));
        }

        let timeout = scenario.timeout.unwrap_or(self.config.timeout);
        let log = ChunkLog::new();
        let started = Instant::now();
        let follow_up = tokio::time::timeout(timeout, client.execute(&scenario.follow_up, &log)).await;
        let elapsed = started.elapsed();

        let mut result = classify(name, follow_up, &log, timeout, &scenario.expect);
        result.elapsed = elapsed;
        result.observation = Some(observed);

        match result.outcome {
            Outcome::Pass => info!(
                scenario = name,
                elapsed_ms = elapsed.as_millis() as u64,
                attempts = result.attempts,
                "PASS"
            ),
            outcome => warn!(
                scenario = name,
                elapsed_ms = elapsed.as_millis() as u64,
                "{}: {}",
                outcome,
                result.detail
            ),
        }
        result
    }

    fn setup_failed(
        &self,
        name: &str,
        detail: String,
        observed: Option<ServerObservation>,
    ) -> ScenarioResult {
        warn!(scenario = name, "ERROR: {}", detail);
        let mut result = ScenarioResult::new(name, Outcome::Error, detail);
        result.observation = observed;
        result
    }
}

fn classify(
    name: &str,
    follow_up: Result<Result<Exchange, ClientError>, tokio::time::error::Elapsed>,
    log: &ChunkLog,
    timeout: Duration,
    expect: &Expectation,
) -> ScenarioResult {
    match follow_up {
        Err(_) => ScenarioResult::new(
            name,
            Outcome::Hung,
            format!(
                "no resolution within {}ms ({} record(s) received)",
                timeout.as_millis(),
                log.len()
            ),
        ),
        Ok(Err(e)) => {
            let mut result = ScenarioResult::new(name, Outcome::Fail, e.to_string());
            if let ClientError::Transport { attempts, .. } = e {
                result.attempts = attempts;
            }
            result
        }
        Ok(Ok(exchange)) => {
            let mut result = match expect.check(&exchange) {
                Ok(summary) => ScenarioResult::new(name, Outcome::Pass, summary),
                Err(mismatch) => ScenarioResult::new(name, Outcome::Fail, mismatch),
            };
            result.attempts = exchange.attempts;
            result
        }
    }
}
