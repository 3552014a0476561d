//! Sentinel Registry
//!
//! The set of currently known sentinels, keyed by (host, port). Adding an
//! endpoint starts one watcher task per configured observation source;
//! removing it aborts them, which closes their sessions and timers.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;

use super::state::{Endpoint, Observation, Sentinel, SharedSentinel};

/// Something that watches one sentinel and reports what it sees.
///
/// Implemented by the polling and the subscription strategies; the registry
/// runs every configured source for every sentinel it holds.
pub trait ObservationSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Spawn the watcher task for one sentinel
    fn watch(&self, sentinel: SharedSentinel) -> JoinHandle<()>;
}

/// Registry of known sentinels
pub struct SentinelRegistry {
    entries: DashMap<Endpoint, SharedSentinel>,
    sources: Vec<Arc<dyn ObservationSource>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl SentinelRegistry {
    pub fn new(sources: Vec<Arc<dyn ObservationSource>>) -> Self {
        Self {
            entries: DashMap::new(),
            sources,
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a sentinel and start watching it.
    ///
    /// Returns false if the endpoint was already present or the registry
    /// is closed.
    pub fn add(&self, endpoint: Endpoint) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        match self.entries.entry(endpoint) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let sentinel = Arc::new(Sentinel::new(vacant.key().clone(), seq));

                // Spawned under the shard lock so a concurrent remove can't
                // miss the handles.
                for source in &self.sources {
                    sentinel.attach_task(source.watch(sentinel.clone()));
                }

                log::info!(
                    "Sentinel added: {} ({} watcher{})",
                    sentinel.endpoint(),
                    self.sources.len(),
                    if self.sources.len() == 1 { "" } else { "s" }
                );
                vacant.insert(sentinel);
                true
            }
        }
    }

    /// Stop watching a sentinel and forget it; no-op if unknown
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        match self.entries.remove(endpoint) {
            Some((_, sentinel)) => {
                sentinel.shutdown();
                log::info!("Sentinel removed: {}", endpoint);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<SharedSentinel> {
        self.entries.get(endpoint).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the registered sentinels in registration order.
    ///
    /// The snapshot doesn't hold any lock; it can be iterated any number of
    /// times while sentinels are added or removed concurrently.
    pub fn list(&self) -> SentinelSnapshot {
        let mut sentinels: Vec<SharedSentinel> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        sentinels.sort_by_key(|s| s.seq());
        SentinelSnapshot { sentinels }
    }

    /// Latest observation of every sentinel that has reported one
    pub fn observations(&self) -> Vec<Observation> {
        self.list().iter().filter_map(|s| s.observation()).collect()
    }

    /// Remove every sentinel and refuse further additions
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let endpoints: Vec<Endpoint> = self.entries.iter().map(|e| e.key().clone()).collect();
        for endpoint in endpoints {
            self.remove(&endpoint);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Point-in-time list of registered sentinels
#[derive(Debug, Clone, Default)]
pub struct SentinelSnapshot {
    sentinels: Vec<SharedSentinel>,
}

impl SentinelSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &SharedSentinel> + '_ {
        self.sentinels.iter()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> + '_ {
        self.sentinels.iter().map(|s| s.endpoint())
    }

    pub fn len(&self) -> usize {
        self.sentinels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentinels.is_empty()
    }
}

impl<'a> IntoIterator for &'a SentinelSnapshot {
    type Item = &'a SharedSentinel;
    type IntoIter = std::slice::Iter<'a, SharedSentinel>;

    fn into_iter(self) -> Self::IntoIter {
        self.sentinels.iter()
    }
}
