//! Logging setup for the coordinator binary
//!
//! Redis-style verbosity names (debug, verbose, notice, warning, nothing)
//! on top of the `log` facade. Lines go to an append-mode log file, or to
//! stdout when no file is configured.

use crate::config::LoggingConfig;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Redis-style verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisLogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
    Nothing,
}

impl RedisLogLevel {
    /// Unknown names fall back to notice
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "verbose" => Self::Verbose,
            "warning" => Self::Warning,
            "nothing" => Self::Nothing,
            _ => Self::Notice,
        }
    }
}

impl From<RedisLogLevel> for LevelFilter {
    fn from(level: RedisLogLevel) -> Self {
        match level {
            RedisLogLevel::Debug => LevelFilter::Debug,
            RedisLogLevel::Verbose | RedisLogLevel::Notice => LevelFilter::Info,
            RedisLogLevel::Warning => LevelFilter::Warn,
            RedisLogLevel::Nothing => LevelFilter::Off,
        }
    }
}

enum Sink {
    Stdout,
    File(Mutex<File>),
}

/// Writes `pid:mark timestamp message` lines
pub struct FailoverLogger {
    max_level: LevelFilter,
    sink: Sink,
}

impl FailoverLogger {
    pub fn new(config: &LoggingConfig) -> Self {
        let sink = if config.logfile.is_empty() {
            Sink::Stdout
        } else {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.logfile)
            {
                Ok(file) => Sink::File(Mutex::new(file)),
                Err(e) => {
                    eprintln!(
                        "Warning: cannot open log file '{}' ({}), logging to stdout",
                        config.logfile, e
                    );
                    Sink::Stdout
                }
            }
        };

        Self {
            max_level: RedisLogLevel::parse(&config.loglevel).into(),
            sink,
        }
    }
}

/// Redis marks: `.` trace, `-` debug, `*` info, `#` warn, `!` error
fn level_mark(level: Level) -> char {
    match level {
        Level::Trace => '.',
        Level::Debug => '-',
        Level::Info => '*',
        Level::Warn => '#',
        Level::Error => '!',
    }
}

/// `seconds.millis` since the epoch
fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

impl Log for FailoverLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "{}:{} {} {}\n",
            std::process::id(),
            level_mark(record.level()),
            timestamp(),
            record.args()
        );
        match &self.sink {
            Sink::Stdout => print!("{}", line),
            Sink::File(file) => {
                let _ = file.lock().write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        let _ = match &self.sink {
            Sink::Stdout => std::io::stdout().flush(),
            Sink::File(file) => file.lock().flush(),
        };
    }
}

/// Install `FailoverLogger` as the global logger
pub fn init_logging(config: &LoggingConfig) -> Result<(), log::SetLoggerError> {
    let logger = FailoverLogger::new(config);
    let max_level = logger.max_level;

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(name: &str) -> LevelFilter {
        RedisLogLevel::parse(name).into()
    }

    #[test]
    fn test_level_names() {
        assert_eq!(filter("debug"), LevelFilter::Debug);
        assert_eq!(filter("verbose"), LevelFilter::Info);
        assert_eq!(filter("WARNING"), LevelFilter::Warn);
        assert_eq!(filter("nothing"), LevelFilter::Off);
        assert_eq!(filter("chatty"), LevelFilter::Info);
    }

    #[test]
    fn test_file_logger_appends_filtered_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failover.log");
        let logger = FailoverLogger::new(&LoggingConfig {
            loglevel: "notice".to_string(),
            logfile: path.to_string_lossy().into_owned(),
        });

        logger.log(
            &Record::builder()
                .args(format_args!("Master mymaster available at 10.0.0.1:6379"))
                .level(Level::Info)
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("filtered out"))
                .level(Level::Debug)
                .build(),
        );
        logger.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains(":* "));
        assert!(content.ends_with("Master mymaster available at 10.0.0.1:6379\n"));
    }
}
