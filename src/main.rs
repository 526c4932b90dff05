use clap::Parser;
use idle_goaway::config::{HarnessConfig, IdlePolicy, RunnerConfig, ServerConfig, StreamPolicy};
use idle_goaway::http::h2::H2Server;
use idle_goaway::scenario::{self, Format, Report, Runner, Target};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit status for harness setup failures (bad flags, bind, certificate)
const SETUP_FAILURE: u8 = 2;

/// HTTP/2 idle-GOAWAY fault-injection harness
///
/// Starts a TLS HTTP/2 server that sends GOAWAY to idle connections and later
/// closes their sockets, then checks that a pooled client recovers from the
/// stale connection instead of hanging.
#[derive(Debug, clap::Parser)]
#[command(author, name = "idle-goaway", version)]
struct Cli {
    /// Loopback port to listen on (0 picks a free one)
    #[arg(long, default_value_t = 8443)]
    port: u16,
    /// Idle time before the server sends GOAWAY
    #[arg(long, default_value_t = 3000, value_name = "MS")]
    threshold_ms: u64,
    /// Time between GOAWAY and the forced TCP close
    #[arg(long, default_value_t = 5000, value_name = "MS")]
    grace_ms: u64,
    /// How often the idle watchdog looks at a connection
    #[arg(long, default_value_t = 100, value_name = "MS")]
    poll_ms: u64,
    /// Bound on every warm-up and follow-up exchange
    #[arg(long, default_value_t = 15000, value_name = "MS")]
    timeout_ms: u64,
    /// Pause between scenarios
    #[arg(long, default_value_t = 500, value_name = "MS")]
    settle_ms: u64,
    /// Extra idle time on top of the server's deadlines
    #[arg(long, default_value_t = 2000, value_name = "MS")]
    slack_ms: u64,
    /// Run the suite this many times, each against a fresh server
    #[arg(long, default_value_t = 1)]
    rounds: u32,
    /// Only run the named scenario (repeatable)
    #[arg(long, value_name = "SCENARIO")]
    only: Vec<String>,
    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,
    /// Debug logging
    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> HarnessConfig {
        let idle = IdlePolicy::default()
            .threshold(Duration::from_millis(self.threshold_ms))
            .grace(Duration::from_millis(self.grace_ms))
            .poll_interval(Duration::from_millis(self.poll_ms));

        HarnessConfig {
            server: ServerConfig::default()
                .port(self.port)
                .idle(idle)
                .stream(StreamPolicy::default()),
            runner: RunnerConfig::default()
                .timeout(Duration::from_millis(self.timeout_ms))
                .settle(Duration::from_millis(self.settle_ms))
                .slack(Duration::from_millis(self.slack_ms)),
            rounds: self.rounds,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "idle_goaway=debug" } else { "idle_goaway=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config();
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::from(SETUP_FAILURE);
    }

    let scenarios = match scenario::select(scenario::canonical(&config.runner), &cli.only) {
        Ok(scenarios) => scenarios,
        Err(unknown) => {
            error!("unknown scenario(s): {}", unknown.join(", "));
            return ExitCode::from(SETUP_FAILURE);
        }
    };

    let runner = Runner::new(config.runner, config.server.idle);
    let mut report = Report::new();

    for round in 1..=config.rounds {
        let handle = match H2Server::bind(config.server.clone()).and_then(H2Server::spawn) {
            Ok(handle) => handle,
            Err(e) => {
                error!(addr = %config.server.bind, "server setup failed: {}", e);
                return ExitCode::from(SETUP_FAILURE);
            }
        };
        info!(round, url = %handle.url("/"), scenarios = scenarios.len(), "round starting");

        let results = runner.run_all(&scenarios, &Target::from_handle(&handle)).await;
        report.push_round(results);

        tokio::task::block_in_place(|| handle.shutdown());
    }

    match report.render(cli.format) {
        Ok(rendered) => println!("{}", rendered.trim_end()),
        Err(e) => {
            error!("failed to render report: {}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::from(report.exit_code())
}
