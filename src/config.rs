//! Coordinator configuration
//!
//! Runtime options for the coordinator and its master clients, plus the
//! `sockudo-failover.conf` file format:
//!
//! ```text
//! master-name mymaster
//! sentinel 10.0.0.1 26379
//! sentinel 10.0.0.2 26379
//! ping-period 500
//! quorum 2
//! strategy both
//! debug no
//! loglevel notice
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::ConnectOptions;
use crate::error::{Error, Result};
use crate::sentinel::dedup::{DEDUP_SWEEP_PERIOD_MS, DEDUP_WINDOW_MS};
use crate::sentinel::state::Endpoint;

/// Default interval between polls of one sentinel
pub const DEFAULT_PING_PERIOD_MS: u64 = 500;

/// Default connect/read timeout for sentinel and master sessions
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default overall deadline of one fresh-query round
pub const DEFAULT_ROUND_TIMEOUT_MS: u64 = 5000;

/// Delay before the first unconditional assessment
pub const DEFAULT_INITIAL_ASSESS_DELAY_MS: u64 = 5000;

/// How sentinels are watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchStrategy {
    /// Periodic INFO + peer discovery
    #[default]
    Polling,
    /// Pub/sub event stream
    Subscription,
    /// Both at once, for faster convergence
    Both,
}

impl WatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Subscription => "subscription",
            Self::Both => "both",
        }
    }

    pub fn polls(&self) -> bool {
        matches!(self, Self::Polling | Self::Both)
    }

    pub fn subscribes(&self) -> bool {
        matches!(self, Self::Subscription | Self::Both)
    }
}

impl FromStr for WatchStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "polling" | "poll" => Ok(Self::Polling),
            "subscription" | "subscribe" | "pubsub" => Ok(Self::Subscription),
            "both" => Ok(Self::Both),
            other => Err(Error::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

impl fmt::Display for WatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for `Coordinator::start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub ping_period: Duration,
    /// Agreeing sentinels needed to elect a master; `None` means a
    /// majority of the seed list
    pub quorum: Option<usize>,
    pub strategy: WatchStrategy,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub round_timeout: Duration,
    pub dedup_window: Duration,
    pub dedup_sweep_period: Duration,
    pub initial_assess_delay: Duration,
    /// Log transient per-sentinel failures at warn instead of debug
    pub debug: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_millis(DEFAULT_PING_PERIOD_MS),
            quorum: None,
            strategy: WatchStrategy::default(),
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            round_timeout: Duration::from_millis(DEFAULT_ROUND_TIMEOUT_MS),
            dedup_window: Duration::from_millis(DEDUP_WINDOW_MS),
            dedup_sweep_period: Duration::from_millis(DEDUP_SWEEP_PERIOD_MS),
            initial_assess_delay: Duration::from_millis(DEFAULT_INITIAL_ASSESS_DELAY_MS),
            debug: false,
        }
    }
}

impl CoordinatorOptions {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        }
    }

    /// Configured quorum, or floor(1 + seeds/2)
    pub fn effective_quorum(&self, seed_count: usize) -> usize {
        self.quorum.unwrap_or(1 + seed_count / 2).max(1)
    }
}

/// Options for one master client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterClientOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for MasterClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl MasterClientOptions {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        }
    }
}

/// Logger settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// debug | verbose | notice | warning | nothing
    pub loglevel: String,
    /// Empty for stdout
    pub logfile: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            loglevel: "notice".to_string(),
            logfile: String::new(),
        }
    }
}

/// Everything the binary needs to start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverConfig {
    pub master_name: String,
    pub sentinels: Vec<Endpoint>,
    pub options: CoordinatorOptions,
    pub logging: LoggingConfig,
}

impl FailoverConfig {
    /// Check the settings needed to start a coordinator
    pub fn validate(&self) -> Result<()> {
        if self.master_name.is_empty() {
            return Err(Error::Config("master-name is required".to_string()));
        }
        if self.sentinels.is_empty() {
            return Err(Error::Config(
                "at least one sentinel seed is required".to_string(),
            ));
        }
        if self.options.quorum == Some(0) {
            return Err(Error::Config("quorum must be at least 1".to_string()));
        }
        if self.options.ping_period.is_zero() {
            return Err(Error::Config("ping-period must be positive".to_string()));
        }
        Ok(())
    }
}

/// Parse a config file into `config`
pub fn parse_config_file(path: &Path, config: &mut FailoverConfig) -> Result<()> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config_str(&content, config);
    Ok(())
}

/// Apply every directive in `content`; bad lines are reported and skipped
pub fn parse_config_str(content: &str, config: &mut FailoverConfig) {
    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Err(e) = parse_line(line, config) {
            eprintln!("Warning: line {}: {}", line_num + 1, e);
        }
    }
}

fn parse_line(line: &str, config: &mut FailoverConfig) -> Result<()> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(directive) = parts.first() else {
        return Ok(());
    };
    let directive = directive.to_lowercase();
    let value = || {
        parts
            .get(1)
            .copied()
            .ok_or_else(|| Error::Config(format!("{} requires a value", directive)))
    };

    match directive.as_str() {
        "master-name" => config.master_name = value()?.to_string(),
        "sentinel" => {
            // sentinel <host> <port>
            if parts.len() < 3 {
                return Err(Error::Config("sentinel requires: host port".to_string()));
            }
            let endpoint = Endpoint::from_parts(parts[1], parts[2])
                .ok_or_else(|| Error::Config(format!("invalid sentinel address {} {}", parts[1], parts[2])))?;
            if !config.sentinels.contains(&endpoint) {
                config.sentinels.push(endpoint);
            }
        }
        "ping-period" => config.options.ping_period = parse_ms(&directive, value()?)?,
        "quorum" => {
            let quorum: usize = value()?
                .parse()
                .map_err(|_| Error::Config("invalid quorum".to_string()))?;
            config.options.quorum = Some(quorum);
        }
        "strategy" => config.options.strategy = value()?.parse()?,
        "connect-timeout" => config.options.connect_timeout = parse_ms(&directive, value()?)?,
        "read-timeout" => config.options.read_timeout = parse_ms(&directive, value()?)?,
        "round-timeout" => config.options.round_timeout = parse_ms(&directive, value()?)?,
        "dedup-window" => config.options.dedup_window = parse_ms(&directive, value()?)?,
        "initial-assess-delay" => {
            config.options.initial_assess_delay = parse_ms(&directive, value()?)?
        }
        "debug" => config.options.debug = parse_bool(value()?)?,
        "loglevel" => config.logging.loglevel = value()?.to_string(),
        "logfile" => config.logging.logfile = value()?.trim_matches('"').to_string(),
        _ => {
            // Ignore unknown directives for compatibility
        }
    }

    Ok(())
}

fn parse_ms(directive: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::Config(format!("invalid {} '{}'", directive, value)))
}

pub fn parse_bool(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(Error::Config(format!("invalid boolean value: {}", s))),
    }
}
