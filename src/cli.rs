use crate::config::{FailoverConfig, parse_bool, parse_config_file};
use crate::sentinel::state::Endpoint;
use clap::Parser;

use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sockudo-failover")]
#[command(author = "Sockudo Team")]
#[command(version = "0.1.0")]
#[command(about = "Sentinel-driven master failover coordinator", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(value_name = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Name of the monitored master
    #[arg(long)]
    pub master_name: Option<String>,

    /// Seed sentinel, repeatable
    #[arg(long = "sentinel", value_name = "HOST:PORT")]
    pub sentinels: Vec<Endpoint>,

    /// Interval between sentinel polls in milliseconds (default: 500)
    #[arg(long)]
    pub ping_period: Option<u64>,

    /// Agreeing sentinels needed to elect a master (default: seed majority)
    #[arg(long)]
    pub quorum: Option<usize>,

    /// Watch strategy (polling, subscription, both)
    #[arg(long)]
    pub strategy: Option<String>,

    /// Log level (debug, verbose, notice, warning, nothing)
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log file path
    #[arg(long)]
    pub logfile: Option<String>,

    /// Log per-sentinel failures at warning level (yes/no)
    #[arg(long, num_args = 0..=1, default_missing_value = "yes")]
    pub debug: Option<String>,
}

impl Cli {
    /// Parse the command line and merge it over the config file
    pub fn load_config() -> Result<FailoverConfig, String> {
        Cli::parse().into_config()
    }

    pub fn into_config(self) -> Result<FailoverConfig, String> {
        let mut config = FailoverConfig::default();

        if let Some(path) = &self.config_file {
            parse_config_file(path, &mut config).map_err(|e| e.to_string())?;
        }

        if let Some(name) = self.master_name {
            config.master_name = name;
        }
        // Seeds on the command line replace the file's list
        if !self.sentinels.is_empty() {
            config.sentinels = self.sentinels;
        }
        if let Some(ms) = self.ping_period {
            config.options.ping_period = Duration::from_millis(ms);
        }
        if let Some(quorum) = self.quorum {
            config.options.quorum = Some(quorum);
        }
        if let Some(strategy) = self.strategy {
            config.options.strategy = strategy.parse().map_err(|e: crate::Error| e.to_string())?;
        }
        if let Some(loglevel) = self.loglevel {
            config.logging.loglevel = loglevel;
        }
        if let Some(logfile) = self.logfile {
            config.logging.logfile = logfile;
        }
        if let Some(debug) = self.debug {
            config.options.debug = parse_bool(&debug).map_err(|e| e.to_string())?;
        }

        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}
