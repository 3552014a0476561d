//! Subscription Strategy
//!
//! Keeps one pattern subscription (`PSUBSCRIBE *`) per sentinel and turns
//! the published events into notifications. The same event arrives once per
//! sentinel, so messages pass through the shared deduplicator first.
//!
//! A sentinel whose subscription fails or ends is reported unreachable and
//! the watcher stops; the coordinator drops it from the registry.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::connection::{ConnectOptions, Connection, PublishedMessage};
use crate::error::Result;

use super::Signal;
use super::dedup::EventDeduplicator;
use super::notification::{Classified, classify};
use super::registry::ObservationSource;
use super::state::{SharedSentinel, current_time_ms};

/// Watches sentinels through their event channels
pub struct SubscriptionSource {
    master_name: Arc<str>,
    connect: ConnectOptions,
    dedup: Arc<EventDeduplicator>,
    signals: UnboundedSender<Signal>,
    debug: bool,
}

impl SubscriptionSource {
    pub fn new(
        master_name: impl Into<Arc<str>>,
        connect: ConnectOptions,
        dedup: Arc<EventDeduplicator>,
        signals: UnboundedSender<Signal>,
        debug: bool,
    ) -> Self {
        Self {
            master_name: master_name.into(),
            connect,
            dedup,
            signals,
            debug,
        }
    }
}

impl ObservationSource for SubscriptionSource {
    fn name(&self) -> &'static str {
        "subscription"
    }

    fn watch(&self, sentinel: SharedSentinel) -> JoinHandle<()> {
        let master_name = self.master_name.clone();
        let connect = self.connect;
        let dedup = self.dedup.clone();
        let signals = self.signals.clone();
        let debug = self.debug;

        tokio::spawn(async move {
            let endpoint = sentinel.endpoint().clone();
            match subscribe(&sentinel, &master_name, &connect, &dedup, &signals).await {
                Ok(()) => log::info!("Subscription to sentinel {} ended", endpoint),
                Err(e) => super::log_peer_error(debug, &endpoint, "subscription", &e),
            }
            let _ = signals.send(Signal::Unreachable(endpoint));
        })
    }
}

/// Run one subscription until the session ends
async fn subscribe(
    sentinel: &SharedSentinel,
    master_name: &str,
    connect: &ConnectOptions,
    dedup: &EventDeduplicator,
    signals: &UnboundedSender<Signal>,
) -> Result<()> {
    let conn = Connection::open(sentinel.endpoint(), connect).await?;
    let mut subscription = conn.psubscribe("*").await?;
    log::debug!("Subscribed to sentinel {}", subscription.endpoint());

    while let Some(message) = subscription.next_message().await? {
        if let Some(signal) = handle_message(&message, master_name, dedup, current_time_ms()) {
            if signals.send(signal).is_err() {
                break;
            }
        }
    }

    Ok(())
}

/// Dedup and classify one published message
pub(crate) fn handle_message(
    message: &PublishedMessage,
    master_name: &str,
    dedup: &EventDeduplicator,
    now_ms: u64,
) -> Option<Signal> {
    let channel = String::from_utf8_lossy(&message.channel);
    let payload = String::from_utf8_lossy(&message.payload);

    if !dedup.should_process(&EventDeduplicator::key(&channel, &payload), now_ms) {
        log::trace!("Duplicate event {} {}", channel, payload);
        return None;
    }

    match classify(&channel, &payload, master_name) {
        Classified::Act(notification) => {
            log::debug!("Sentinel event {} {}", channel, payload);
            Some(Signal::Notification(notification))
        }
        Classified::Ignore => None,
        Classified::Unknown => {
            log::debug!("Unknown sentinel channel {}", channel);
            None
        }
    }
}
