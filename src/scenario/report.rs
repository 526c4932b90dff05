//! Suite report: per-scenario table or JSON, plus cross-round divergence

use super::{Outcome, ScenarioResult};
use serde::Serialize;
use std::fmt::Write as _;

/// Output format of the final report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    #[default]
    Table,
    Json,
}

/// A scenario classified differently across rounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub scenario: String,
    /// Outcome per round, in round order
    pub outcomes: Vec<Outcome>,
}

/// Results of every round of the suite
#[derive(Debug, Clone, Default)]
pub struct Report {
    rounds: Vec<Vec<ScenarioResult>>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    rounds: &'a [Vec<ScenarioResult>],
    divergent: Vec<Divergence>,
    passed: bool,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_round(&mut self, results: Vec<ScenarioResult>) {
        self.rounds.push(results);
    }

    pub fn rounds(&self) -> &[Vec<ScenarioResult>] {
        &self.rounds
    }

    /// Scenarios whose outcome was not the same in every round
    pub fn divergences(&self) -> Vec<Divergence> {
        let Some(first) = self.rounds.first() else {
            return Vec::new();
        };

        first
            .iter()
            .filter_map(|result| {
                let outcomes: Vec<Outcome> = self
                    .rounds
                    .iter()
                    .filter_map(|round| round.iter().find(|r| r.scenario == result.scenario))
                    .map(|r| r.outcome)
                    .collect();
                let diverged = outcomes.iter().any(|o| *o != result.outcome);
                diverged.then(|| Divergence {
                    scenario: result.scenario.clone(),
                    outcomes,
                })
            })
            .collect()
    }

    /// Every result passed and every round agreed
    pub fn passed(&self) -> bool {
        !self.rounds.is_empty()
            && self
                .rounds
                .iter()
                .flatten()
                .all(|r| r.outcome == Outcome::Pass)
            && self.divergences().is_empty()
    }

    /// Process exit status: 0 when the suite passed, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            1
        }
    }

    pub fn render(&self, format: Format) -> Result<String, serde_json::Error> {
        match format {
            Format::Table => Ok(self.render_table()),
            Format::Json => self.render_json(),
        }
    }

    pub fn render_json(&self) -> Result<String, serde_json::Error> {
        let report = JsonReport {
            rounds: &self.rounds,
            divergent: self.divergences(),
            passed: self.passed(),
        };
        serde_json::to_string_pretty(&report)
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let multi = self.rounds.len() > 1;

        for (i, round) in self.rounds.iter().enumerate() {
            if multi {
                let _ = writeln!(out, "round {}", i + 1);
            }
            let width = round
                .iter()
                .map(|r| r.scenario.len())
                .max()
                .unwrap_or(0)
                .max("SCENARIO".len());

            let _ = writeln!(
                out,
                "{:<width$}  {:<7}  {:>9}  {:>8}  {:>6}  {:>6}  DETAIL",
                "SCENARIO",
                "OUTCOME",
                "ELAPSED",
                "ATTEMPTS",
                "GOAWAY",
                "CLOSED",
                width = width
            );
            for r in round {
                let (goaway, closed) = match r.observation {
                    Some(o) => (o.goaways.to_string(), o.sockets_closed.to_string()),
                    None => ("-".to_string(), "-".to_string()),
                };
                let _ = writeln!(
                    out,
                    "{:<width$}  {:<7}  {:>7}ms  {:>8}  {:>6}  {:>6}  {}",
                    r.scenario,
                    r.outcome,
                    r.elapsed.as_millis(),
                    r.attempts,
                    goaway,
                    closed,
                    r.detail,
                    width = width
                );
            }
        }

        for d in self.divergences() {
            let outcomes: Vec<&str> = d.outcomes.iter().map(Outcome::as_str).collect();
            let _ = writeln!(out, "DIVERGED {}: {}", d.scenario, outcomes.join(" / "));
        }

        let all: Vec<&ScenarioResult> = self.rounds.iter().flatten().collect();
        let count = |outcome: Outcome| all.iter().filter(|r| r.outcome == outcome).count();
        let _ = writeln!(
            out,
            "{} passed, {} failed, {} hung, {} error(s) in {} round(s)",
            count(Outcome::Pass),
            count(Outcome::Fail),
            count(Outcome::Hung),
            count(Outcome::Error),
            self.rounds.len()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ServerObservation;
    use std::time::Duration;

    fn result(name: &str, outcome: Outcome) -> ScenarioResult {
        let mut r = ScenarioResult::new(name, outcome, "detail");
        r.elapsed = Duration::from_millis(42);
        r.attempts = 1;
        r.observation = Some(ServerObservation {
            goaways: 1,
            sockets_closed: 0,
        });
        r
    }

    #[test]
    fn test_all_pass() {
        let mut report = Report::new();
        report.push_round(vec![
            result("baseline-unary-retry", Outcome::Pass),
            result("bidi-retry", Outcome::Pass),
        ]);
        report.push_round(vec![
            result("baseline-unary-retry", Outcome::Pass),
            result("bidi-retry", Outcome::Pass),
        ]);

        assert!(report.divergences().is_empty());
        assert!(report.passed());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_non_pass_fails_the_suite() {
        let mut report = Report::new();
        report.push_round(vec![
            result("baseline-unary-retry", Outcome::Pass),
            result("bidi-retry", Outcome::Hung),
        ]);

        assert!(!report.passed());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_empty_report_fails() {
        assert_eq!(Report::new().exit_code(), 1);
    }

    #[test]
    fn test_divergence() {
        let mut report = Report::new();
        report.push_round(vec![
            result("baseline-unary-retry", Outcome::Pass),
            result("bidi-retry", Outcome::Hung),
        ]);
        report.push_round(vec![
            result("baseline-unary-retry", Outcome::Pass),
            result("bidi-retry", Outcome::Pass),
        ]);

        let divergent = report.divergences();
        assert_eq!(
            divergent,
            vec![Divergence {
                scenario: "bidi-retry".to_string(),
                outcomes: vec![Outcome::Hung, Outcome::Pass],
            }]
        );
        assert!(report.render_table().contains("DIVERGED bidi-retry: HUNG / PASS"));
    }

    #[test]
    fn test_table() {
        let mut report = Report::new();
        report.push_round(vec![
            result("baseline-unary-retry", Outcome::Pass),
            ScenarioResult::new("post-tcp-close", Outcome::Error, "server sent no GOAWAY"),
        ]);

        let table = report.render_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("SCENARIO"));
        assert!(lines[1].contains("PASS"));
        assert!(lines[1].contains("42ms"));
        assert!(lines[2].contains("ERROR"));
        assert!(lines[2].ends_with("server sent no GOAWAY"));
        assert_eq!(lines[3], "1 passed, 0 failed, 0 hung, 1 error(s) in 1 round(s)");
    }

    #[test]
    fn test_json() {
        let mut report = Report::new();
        report.push_round(vec![result("bidi-retry", Outcome::Fail)]);

        let json: serde_json::Value =
            serde_json::from_str(&report.render(Format::Json).unwrap()).unwrap();
        assert_eq!(json["passed"], false);
        assert_eq!(json["rounds"][0][0]["scenario"], "bidi-retry");
        assert_eq!(json["rounds"][0][0]["outcome"], "FAIL");
        assert_eq!(json["rounds"][0][0]["observation"]["goaways"], 1);
        assert!(json["divergent"].as_array().unwrap().is_empty());
    }
}
