//! Sentinel observation state
//!
//! Identity of monitored endpoints and the per-sentinel view of the master
//! that the quorum engine tallies.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

use crate::error::Error;

// =============================================================================
// Endpoint
// =============================================================================

/// Host/port pair identifying a sentinel or a master
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a host and a port given as separate text fields
    pub fn from_parts(host: &str, port: &str) -> Option<Self> {
        if host.is_empty() {
            return None;
        }
        let port = port.trim().parse().ok()?;
        Some(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse `host:port`; the port is taken after the last colon
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("expected host:port, got '{}'", s)))?;
        Self::from_parts(host, port)
            .ok_or_else(|| Error::Config(format!("invalid endpoint '{}'", s)))
    }
}

// =============================================================================
// Master status as reported by one sentinel
// =============================================================================

/// Master status tag from the sentinel INFO output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    Ok,
    /// Subjectively down: this sentinel alone can't reach it
    SDown,
    /// Objectively down: the sentinels agree it is unreachable
    ODown,
}

impl MasterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::SDown => "sdown",
            Self::ODown => "odown",
        }
    }
}

impl FromStr for MasterStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "sdown" => Ok(Self::SDown),
            "odown" => Ok(Self::ODown),
            other => Err(Error::unexpected(
                "INFO",
                format!("unknown master status '{}'", other),
            )),
        }
    }
}

/// Last master address/status one sentinel reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedMaster {
    pub address: Endpoint,
    pub status: MasterStatus,
}

/// Ephemeral report from one sentinel, consumed by the quorum engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub source: Endpoint,
    pub master: ObservedMaster,
}

// =============================================================================
// Sentinel
// =============================================================================

/// One monitor endpoint under observation.
///
/// Owned by the registry; its watcher tasks are aborted on removal, which
/// drops their sessions and pending timers.
#[derive(Debug)]
pub struct Sentinel {
    endpoint: Endpoint,
    /// Registration order, used to keep snapshots stable
    seq: u64,
    last_observed: RwLock<Option<ObservedMaster>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sentinel {
    pub(crate) fn new(endpoint: Endpoint, seq: u64) -> Self {
        Self {
            endpoint,
            seq,
            last_observed: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn last_observed(&self) -> Option<ObservedMaster> {
        self.last_observed.read().clone()
    }

    /// Current observation, if this sentinel has reported one
    pub fn observation(&self) -> Option<Observation> {
        self.last_observed().map(|master| Observation {
            source: self.endpoint.clone(),
            master,
        })
    }

    /// Replace the cached view; returns true if it changed
    pub fn update_observed(&self, observed: ObservedMaster) -> bool {
        let mut current = self.last_observed.write();
        if current.as_ref() == Some(&observed) {
            return false;
        }
        *current = Some(observed);
        true
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Abort all watcher tasks
    pub(crate) fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub type SharedSentinel = Arc<Sentinel>;

/// Get current time in milliseconds since UNIX epoch
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep: Endpoint = "10.0.0.1:26379".parse().unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.1", 26379));
        assert_eq!(ep.to_string(), "10.0.0.1:26379");

        assert!("10.0.0.1".parse::<Endpoint>().is_err());
        assert!(":26379".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_master_status_parse() {
        assert_eq!("ok".parse::<MasterStatus>().unwrap(), MasterStatus::Ok);
        assert_eq!("odown".parse::<MasterStatus>().unwrap(), MasterStatus::ODown);
        assert!("weird".parse::<MasterStatus>().is_err());
    }

    #[test]
    fn test_update_observed_reports_changes_only() {
        let sentinel = Sentinel::new(Endpoint::new("127.0.0.1", 26379), 0);
        let observed = ObservedMaster {
            address: Endpoint::new("10.0.0.1", 6379),
            status: MasterStatus::Ok,
        };

        assert!(sentinel.update_observed(observed.clone()));
        assert!(!sentinel.update_observed(observed.clone()));

        let down = ObservedMaster {
            status: MasterStatus::ODown,
            ..observed
        };
        assert!(sentinel.update_observed(down));
        assert_eq!(
            sentinel.observation().unwrap().master.status,
            MasterStatus::ODown
        );
    }
}
