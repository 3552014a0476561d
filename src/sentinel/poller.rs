//! Polling Strategy
//!
//! Periodically queries each sentinel:
//! - INFO for the sentinel's view of the master (address + status)
//! - SENTINEL sentinels <name> to discover peers
//!
//! Each cycle opens a short-lived session with a single connection attempt,
//! and the next cycle is scheduled only after the current one ended, so
//! polls of one sentinel never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::connection::{ConnectOptions, Connection};
use crate::error::{Error, Result};

use super::Signal;
use super::registry::ObservationSource;
use super::reply::{find_master, parse_sentinels};
use super::state::SharedSentinel;

/// Watches sentinels by polling them every `ping_period`
pub struct PollingSource {
    master_name: Arc<str>,
    ping_period: Duration,
    connect: ConnectOptions,
    signals: UnboundedSender<Signal>,
    debug: bool,
}

impl PollingSource {
    pub fn new(
        master_name: impl Into<Arc<str>>,
        ping_period: Duration,
        connect: ConnectOptions,
        signals: UnboundedSender<Signal>,
        debug: bool,
    ) -> Self {
        Self {
            master_name: master_name.into(),
            ping_period,
            connect,
            signals,
            debug,
        }
    }
}

impl ObservationSource for PollingSource {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn watch(&self, sentinel: SharedSentinel) -> JoinHandle<()> {
        let master_name = self.master_name.clone();
        let ping_period = self.ping_period;
        let connect = self.connect;
        let signals = self.signals.clone();
        let debug = self.debug;

        tokio::spawn(async move {
            loop {
                if let Err(e) = poll_once(&sentinel, &master_name, &connect, &signals).await {
                    super::log_peer_error(debug, sentinel.endpoint(), "poll", &e);
                }
                if signals.is_closed() {
                    break;
                }
                sleep(ping_period).await;
            }
        })
    }
}

/// One poll cycle against one sentinel
pub(crate) async fn poll_once(
    sentinel: &SharedSentinel,
    master_name: &str,
    connect: &ConnectOptions,
    signals: &UnboundedSender<Signal>,
) -> Result<()> {
    let mut conn = Connection::open(sentinel.endpoint(), connect).await?;

    let info = conn.command(&[b"INFO"]).await?;
    let info = info
        .to_text()
        .ok_or_else(|| Error::unexpected("INFO", "reply is not a string"))?;

    // No record for this master name means no observation
    if let Some(observed) = find_master(&info, master_name)? {
        log::trace!(
            "Sentinel {} reports {} at {} ({})",
            sentinel.endpoint(),
            master_name,
            observed.address,
            observed.status.as_str()
        );
        if sentinel.update_observed(observed) {
            let _ = signals.send(Signal::StateChange(sentinel.endpoint().clone()));
        }
    }

    let reply = conn
        .command(&[b"SENTINEL", b"sentinels", master_name.as_bytes()])
        .await?;
    for peer in parse_sentinels(reply)? {
        let _ = signals.send(Signal::Discovered(peer));
    }

    conn.close().await;
    Ok(())
}
