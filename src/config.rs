//! Harness configuration
//!
//! Timing knobs for the server's idle policy and streaming responses, and for
//! the scenario runner. All durations are plain `Duration`s; the command line
//! front end converts millisecond flags into these structs.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Idle threshold must be non-zero")]
    ZeroThreshold,

    #[error("Watchdog poll interval {poll:?} must be non-zero and shorter than the idle threshold {threshold:?}")]
    PollInterval { poll: Duration, threshold: Duration },

    #[error("Idle slack {slack:?} must be shorter than the grace period {grace:?}")]
    SlackExceedsGrace { slack: Duration, grace: Duration },

    #[error("Follow-up timeout must be non-zero")]
    ZeroTimeout,

    #[error("Rounds must be at least 1")]
    ZeroRounds,
}

/// Result type for configuration
pub type Result<T> = std::result::Result<T, ConfigError>;

/// When the server gives up on an idle connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    /// Idle time after which GOAWAY is sent
    pub threshold: Duration,
    /// Delay between GOAWAY and the forced TCP close
    pub grace: Duration,
    /// Watchdog wake-up interval
    pub poll_interval: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        IdlePolicy {
            threshold: Duration::from_secs(3),
            grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl IdlePolicy {
    /// Set the idle threshold
    pub fn threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the grace period
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Set the watchdog poll interval
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Check the policy is usable
    pub fn validate(&self) -> Result<()> {
        if self.threshold.is_zero() {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.poll_interval.is_zero() || self.poll_interval >= self.threshold {
            return Err(ConfigError::PollInterval {
                poll: self.poll_interval,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

/// Shape of the server-streaming response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Number of chunks sent on `GET /stream`
    pub chunks: u32,
    /// Delay before each chunk
    pub chunk_delay: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        StreamPolicy {
            chunks: 3,
            chunk_delay: Duration::from_millis(300),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Idle watchdog policy
    pub idle: IdlePolicy,
    /// Server-streaming response shape
    pub stream: StreamPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 8443)),
            idle: IdlePolicy::default(),
            stream: StreamPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Listen on the loopback interface at `port` (0 picks a free port)
    pub fn port(mut self, port: u16) -> Self {
        self.bind.set_port(port);
        self
    }

    /// Set the idle policy
    pub fn idle(mut self, idle: IdlePolicy) -> Self {
        self.idle = idle;
        self
    }

    /// Set the streaming policy
    pub fn stream(mut self, stream: StreamPolicy) -> Self {
        self.stream = stream;
        self
    }
}

/// Scenario runner configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Bound on every follow-up exchange
    pub timeout: Duration,
    /// Pause between scenarios
    pub settle: Duration,
    /// Margin added on top of the server's idle deadlines
    pub slack: Duration,
    /// HTTP/2 keep-alive PING interval for clients that probe liveness
    pub probe_interval: Duration,
    /// Gap between request-body lines in duplex scenarios
    pub write_gap: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            timeout: Duration::from_secs(15),
            settle: Duration::from_millis(500),
            slack: Duration::from_secs(2),
            probe_interval: Duration::from_secs(1),
            write_gap: Duration::from_millis(100),
        }
    }
}

impl RunnerConfig {
    /// Set the follow-up timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the settle delay
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the idle slack
    pub fn slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    /// Set the keep-alive PING interval
    pub fn probe_interval(mut self, probe_interval: Duration) -> Self {
        self.probe_interval = probe_interval;
        self
    }

    /// Set the duplex write gap
    pub fn write_gap(mut self, write_gap: Duration) -> Self {
        self.write_gap = write_gap;
        self
    }
}

/// Complete harness configuration
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub server: ServerConfig,
    pub runner: RunnerConfig,
    /// Suite repetitions, each against a fresh server
    pub rounds: u32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            server: ServerConfig::default(),
            runner: RunnerConfig::default(),
            rounds: 1,
        }
    }
}

impl HarnessConfig {
    /// Check the timing relationships the scenarios depend on
    ///
    /// Waiting `threshold + slack` must land after GOAWAY but before the
    /// forced close, so the slack has to stay below the grace period.
    pub fn validate(&self) -> Result<()> {
        let idle = &self.server.idle;
        idle.validate()?;

        if self.runner.slack >= idle.grace {
            return Err(ConfigError::SlackExceedsGrace {
                slack: self.runner.slack,
                grace: idle.grace,
            });
        }
        if self.runner.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.rounds == 0 {
            return Err(ConfigError::ZeroRounds);
        }
        Ok(())
    }
}
