//! Quorum Engine
//!
//! Turns per-sentinel observations into one master decision. Two algorithms:
//!
//! - tally-by-agreement over the cached poll snapshots, recomputed from the
//!   full snapshot on every state change;
//! - majority fresh query, which asks every known sentinel for the master
//!   address and its down verdict and counts the "up" answers.
//!
//! Ties between electable addresses go to the highest number of agreeing
//! sentinels, then to the lowest (host, port).

use std::cmp::Reverse;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::connection::{ConnectOptions, Connection};
use crate::error::Result;
use crate::master::MasterView;

use super::registry::SentinelSnapshot;
use super::reply::{parse_is_down, parse_master_addr};
use super::state::{Endpoint, MasterStatus, Observation};

/// Outcome of one quorum round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A quorum agrees on this master and the view must change
    Available(Endpoint),
    /// No safe master can be determined
    Unavailable,
    /// Keep the current view
    NoChange,
}

/// Aggregated reports for one master address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterTally {
    pub address: Endpoint,
    /// Sentinels reporting status "ok"
    pub oks: usize,
    /// Any sentinel reported this address objectively down
    pub odown: bool,
}

/// Answer of one sentinel in a fresh-query round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub source: Endpoint,
    pub address: Endpoint,
    pub down: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct QuorumEngine {
    quorum: usize,
}

impl QuorumEngine {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum: quorum.max(1),
        }
    }

    /// Majority of `sentinel_count`: floor(1 + n/2)
    pub fn majority(sentinel_count: usize) -> usize {
        1 + sentinel_count / 2
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Group observations by master address, in first-seen order
    pub fn tally(observations: &[Observation]) -> Vec<MasterTally> {
        let mut tallies: Vec<MasterTally> = Vec::new();

        for observation in observations {
            let master = &observation.master;
            let idx = match tallies.iter().position(|t| t.address == master.address) {
                Some(idx) => idx,
                None => {
                    tallies.push(MasterTally {
                        address: master.address.clone(),
                        oks: 0,
                        odown: false,
                    });
                    tallies.len() - 1
                }
            };

            match master.status {
                MasterStatus::Ok => tallies[idx].oks += 1,
                MasterStatus::ODown => tallies[idx].odown = true,
                MasterStatus::SDown => {}
            }
        }

        tallies
    }

    /// Tally-by-agreement over the current snapshot
    pub fn decide_by_agreement(&self, observations: &[Observation], view: &MasterView) -> Decision {
        if observations.is_empty() {
            return Decision::NoChange;
        }

        let tallies = Self::tally(observations);
        let elected = tallies
            .iter()
            .filter(|t| !t.odown && t.oks >= self.quorum)
            .min_by_key(|t| (Reverse(t.oks), t.address.clone()));

        if let Some(elected) = elected {
            if view.address.as_ref() != Some(&elected.address) || !view.healthy {
                return Decision::Available(elected.address.clone());
            }
            return Decision::NoChange;
        }

        // Only give up on the current master if it was itself reported down
        let current_is_odown = view
            .address
            .as_ref()
            .is_some_and(|current| tallies.iter().any(|t| t.odown && &t.address == current));

        if (current_is_odown && !view.suspended) || !view.initialized {
            Decision::Unavailable
        } else {
            Decision::NoChange
        }
    }

    /// Elect the address a majority of `sentinel_count` sentinels report up
    pub fn decide_by_votes(votes: &[Vote], sentinel_count: usize) -> Option<Endpoint> {
        if sentinel_count == 0 {
            return None;
        }
        let needed = Self::majority(sentinel_count);

        let mut ups: Vec<(Endpoint, usize)> = Vec::new();
        for vote in votes.iter().filter(|v| !v.down) {
            match ups.iter_mut().find(|(addr, _)| *addr == vote.address) {
                Some((_, count)) => *count += 1,
                None => ups.push((vote.address.clone(), 1)),
            }
        }

        ups.into_iter()
            .filter(|(_, count)| *count >= needed)
            .min_by_key(|(addr, count)| (Reverse(*count), addr.clone()))
            .map(|(addr, _)| addr)
    }

    /// Ask every sentinel in the snapshot in parallel and elect by majority.
    ///
    /// Each call is bounded by `options`; the whole round by `round_timeout`.
    /// Sentinels that error or miss the deadline cast no vote.
    pub async fn majority_fresh_query(
        snapshot: &SentinelSnapshot,
        master_name: &str,
        options: ConnectOptions,
        round_timeout: Duration,
        debug: bool,
    ) -> Option<Endpoint> {
        let sentinel_count = snapshot.len();
        if sentinel_count == 0 {
            return None;
        }

        let mut calls = JoinSet::new();
        for endpoint in snapshot.endpoints() {
            let endpoint = endpoint.clone();
            let master_name = master_name.to_string();
            calls.spawn(async move {
                let result = query_sentinel(&endpoint, &master_name, &options).await;
                (endpoint, result)
            });
        }

        let mut votes = Vec::with_capacity(sentinel_count);
        let collect = async {
            while let Some(joined) = calls.join_next().await {
                match joined {
                    Ok((_, Ok(Some(vote)))) => votes.push(vote),
                    Ok((endpoint, Ok(None))) => {
                        log::debug!("Sentinel {} doesn't know master {}", endpoint, master_name);
                    }
                    Ok((endpoint, Err(e))) => {
                        super::log_peer_error(debug, &endpoint, "quorum query", &e);
                    }
                    Err(e) => log::debug!("Quorum query task failed: {}", e),
                }
            }
        };

        if timeout(round_timeout, collect).await.is_err() {
            log::warn!(
                "Quorum round for {} hit its {:?} deadline with {}/{} replies",
                master_name,
                round_timeout,
                votes.len(),
                sentinel_count
            );
        }

        let elected = Self::decide_by_votes(&votes, sentinel_count);
        log::debug!(
            "Quorum round for {}: {} votes from {} sentinels, elected {:?}",
            master_name,
            votes.len(),
            sentinel_count,
            elected
        );
        elected
    }
}

/// Address-by-name followed by down-by-address against one sentinel
async fn query_sentinel(
    endpoint: &Endpoint,
    master_name: &str,
    options: &ConnectOptions,
) -> Result<Option<Vote>> {
    let mut conn = Connection::open(endpoint, options).await?;

    let reply = conn
        .command(&[b"SENTINEL", b"get-master-addr-by-name", master_name.as_bytes()])
        .await?;
    let Some(address) = parse_master_addr(reply)? else {
        conn.close().await;
        return Ok(None);
    };

    let port = address.port.to_string();
    let reply = conn
        .command(&[
            b"SENTINEL",
            b"is-master-down-by-addr",
            address.host.as_bytes(),
            port.as_bytes(),
            b"0",
            b"*",
        ])
        .await?;
    let verdict = parse_is_down(reply)?;
    conn.close().await;

    Ok(Some(Vote {
        source: endpoint.clone(),
        address,
        down: verdict.down,
    }))
}
