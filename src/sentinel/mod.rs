//! Sentinel observation layer
//!
//! Everything the coordinator needs to know about the sentinel deployment:
//!
//! - Registry of known sentinels with one watcher task per strategy
//! - Polling strategy (INFO + peer discovery)
//! - Subscription strategy (pub/sub events, deduplicated)
//! - Quorum engine turning observations into a master decision
//!
//! Watchers never touch the master view directly; they report `Signal`s to
//! the coordinator's event loop, which is the single writer.

pub mod dedup;
pub mod notification;
pub mod poller;
pub mod quorum;
pub mod registry;
pub mod reply;
pub mod state;
pub mod subscriber;

pub use dedup::EventDeduplicator;
pub use notification::{Classified, Notification, classify};
pub use poller::PollingSource;
pub use quorum::{Decision, MasterTally, QuorumEngine, Vote};
pub use registry::{ObservationSource, SentinelRegistry, SentinelSnapshot};
pub use state::{Endpoint, MasterStatus, Observation, ObservedMaster, Sentinel, SharedSentinel};
pub use subscriber::SubscriptionSource;

use crate::error::Error;

/// Message from a watcher (or timer) to the coordinator's event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A sentinel's cached observation changed
    StateChange(Endpoint),
    /// A deduplicated pub/sub notification
    Notification(Notification),
    /// A peer sentinel was discovered
    Discovered(Endpoint),
    /// A sentinel's subscription failed or ended
    Unreachable(Endpoint),
    /// Re-run tally-by-agreement over the current snapshot
    Reassess,
    /// A majority fresh query finished
    Confirmed(Option<Endpoint>),
}

/// Log a transient failure talking to one sentinel.
///
/// These are expected during failovers, so they stay at debug unless the
/// coordinator runs with `debug` enabled.
pub(crate) fn log_peer_error(debug: bool, endpoint: &Endpoint, context: &str, err: &Error) {
    if debug {
        log::warn!("Sentinel {} {} failed: {}", endpoint, context, err);
    } else {
        log::debug!("Sentinel {} {} failed: {}", endpoint, context, err);
    }
}
