//! Failover Coordinator
//!
//! Composition root: owns the sentinel registry, the master view and the
//! master connection manager, and runs the single event loop that turns
//! watcher signals into master decisions.
//!
//! Decision flow:
//! - poll state change / initial assessment -> tally-by-agreement
//! - `+switch-master`, `+redirect-to-master`, `+reboot` -> master available
//! - `+odown`, `+try-failover` -> unhealthy, then a fresh-query round
//! - `-odown` -> fresh-query round
//! - startup -> fresh-query round to confirm the master early

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep};

use crate::config::{CoordinatorOptions, MasterClientOptions};
use crate::connection::{ConnectOptions, Connection};
use crate::error::{Error, Result};
use crate::master::{MasterClient, MasterConnectionManager, MasterView};
use crate::sentinel::{
    Decision, Endpoint, EventDeduplicator, Notification, ObservationSource, PollingSource,
    QuorumEngine, SentinelRegistry, SentinelSnapshot, Signal, SubscriptionSource,
    state::current_time_ms,
};

/// Buffered events per subscriber before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Observable output of the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    MasterAvailable(Endpoint),
    MasterUnavailable,
    HealthyChange(bool),
}

struct Inner {
    master_name: String,
    options: CoordinatorOptions,
    quorum: QuorumEngine,
    registry: SentinelRegistry,
    view: RwLock<MasterView>,
    manager: MasterConnectionManager,
    events: broadcast::Sender<CoordinatorEvent>,
    signals: mpsc::UnboundedSender<Signal>,
    round_in_progress: Arc<AtomicBool>,
    /// Set by the initial assessment
    settled: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Client-side failover coordinator for one master name
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Start watching `master_name` through the given seed sentinels.
    ///
    /// Fails with `NoSentinelReachable` if none of the seeds accepts a
    /// connection.
    pub async fn start(
        master_name: impl Into<String>,
        seeds: Vec<Endpoint>,
        options: CoordinatorOptions,
    ) -> Result<Self> {
        let master_name = master_name.into();
        if master_name.is_empty() {
            return Err(Error::Config("master name must not be empty".to_string()));
        }

        let mut unique: Vec<Endpoint> = Vec::with_capacity(seeds.len());
        for seed in seeds {
            if !unique.contains(&seed) {
                unique.push(seed);
            }
        }
        if unique.is_empty() {
            return Err(Error::Config(
                "at least one seed sentinel is required".to_string(),
            ));
        }

        let connect = options.connect_options();
        let reachable = probe_seeds(&unique, &connect, options.debug).await;
        if reachable == 0 {
            log::error!(
                "None of the {} seed sentinels for {} is reachable",
                unique.len(),
                master_name
            );
            return Err(Error::NoSentinelReachable(unique.len()));
        }

        let (signals, signal_rx) = mpsc::unbounded_channel();
        let dedup = Arc::new(EventDeduplicator::new(options.dedup_window));

        let mut sources: Vec<Arc<dyn ObservationSource>> = Vec::new();
        if options.strategy.polls() {
            sources.push(Arc::new(PollingSource::new(
                master_name.as_str(),
                options.ping_period,
                connect,
                signals.clone(),
                options.debug,
            )));
        }
        if options.strategy.subscribes() {
            sources.push(Arc::new(SubscriptionSource::new(
                master_name.as_str(),
                connect,
                dedup.clone(),
                signals.clone(),
                options.debug,
            )));
        }

        let quorum = QuorumEngine::new(options.effective_quorum(unique.len()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        log::info!(
            "Starting failover coordinator for {}: {} seed(s), {} reachable, quorum {}, strategy {}",
            master_name,
            unique.len(),
            reachable,
            quorum.quorum(),
            options.strategy
        );

        let inner = Arc::new(Inner {
            master_name,
            options,
            quorum,
            registry: SentinelRegistry::new(sources),
            view: RwLock::new(MasterView::default()),
            manager: MasterConnectionManager::new(),
            events,
            signals,
            round_in_progress: Arc::new(AtomicBool::new(false)),
            settled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        for seed in unique {
            inner.registry.add(seed);
        }

        inner.track(tokio::spawn(Inner::run(inner.clone(), signal_rx)));
        inner.track(spawn_dedup_sweeper(
            dedup,
            inner.options.dedup_sweep_period,
        ));
        inner.track(spawn_initial_assessment(
            inner.signals.clone(),
            inner.options.initial_assess_delay,
        ));
        inner.spawn_fresh_round();

        Ok(Self { inner })
    }

    pub fn master_name(&self) -> &str {
        &self.inner.master_name
    }

    /// Quorum used by tally-by-agreement
    pub fn quorum(&self) -> usize {
        self.inner.quorum.quorum()
    }

    /// Copy of the current master view
    pub fn master(&self) -> MasterView {
        self.inner.view.read().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.view.read().healthy
    }

    /// Sentinels currently known
    pub fn sentinels(&self) -> SentinelSnapshot {
        self.inner.registry.list()
    }

    /// Receiver for `masterAvailable`, `masterUnavailable` and `healthyChange`
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// New master client bound to the current view
    pub fn create_master_client(&self, options: MasterClientOptions) -> Result<MasterClient> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        // Serialized against rebinds, which happen under the write lock
        let view = self.inner.view.read();
        Ok(self.inner.manager.create(&view, &options))
    }

    pub fn add_sentinel(&self, endpoint: Endpoint) -> bool {
        self.inner.registry.add(endpoint)
    }

    pub fn remove_sentinel(&self, endpoint: &Endpoint) -> bool {
        self.inner.registry.remove(endpoint)
    }

    /// Run a majority fresh-query round now and apply its result.
    ///
    /// Returns the confirmed master, if a majority agreed on one.
    pub async fn confirm_master(&self) -> Result<Option<Endpoint>> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }

        let inner = &self.inner;
        let elected = QuorumEngine::majority_fresh_query(
            &inner.registry.list(),
            &inner.master_name,
            inner.options.connect_options(),
            inner.options.round_timeout,
            inner.options.debug,
        )
        .await;

        let _ = inner.signals.send(Signal::Confirmed(elected.clone()));
        Ok(elected)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop every watcher and timer and close every master client.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.registry.close();
        self.inner.manager.close_all();

        log::info!("Failover coordinator for {} stopped", self.inner.master_name);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    /// Single writer of the master view
    async fn run(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            self.handle(signal);
        }
    }

    fn handle(&self, signal: Signal) {
        match signal {
            Signal::StateChange(source) => {
                log::debug!("Sentinel {} changed its view of {}", source, self.master_name);
                self.assess();
            }
            Signal::Reassess => {
                self.settled.store(true, Ordering::Release);
                self.assess();
            }
            Signal::Discovered(endpoint) => {
                self.registry.add(endpoint);
            }
            Signal::Unreachable(endpoint) => {
                self.registry.remove(&endpoint);
            }
            Signal::Notification(Notification::MasterAvailable(address)) => {
                self.apply_available(address);
            }
            Signal::Notification(Notification::SentinelAnnounced(endpoint)) => {
                self.registry.add(endpoint);
            }
            Signal::Notification(Notification::HealthyChange(false)) => {
                let changed = {
                    let mut view = self.view.write();
                    let was_healthy = view.healthy;
                    view.set_unhealthy();
                    was_healthy
                };
                if changed {
                    log::warn!("Master {} reported objectively down", self.master_name);
                    self.emit(CoordinatorEvent::HealthyChange(false));
                }
                self.spawn_fresh_round();
            }
            Signal::Notification(Notification::HealthyChange(true)) => {
                // Only a quorum-backed answer turns the view healthy again
                self.spawn_fresh_round();
            }
            Signal::Confirmed(Some(address)) => self.apply_available(address),
            Signal::Confirmed(None) => {
                let pending_down = {
                    let view = self.view.read();
                    view.initialized && !view.healthy && !view.suspended
                };
                if pending_down {
                    self.apply_unavailable();
                }
            }
        }
    }

    /// Tally-by-agreement over the current snapshot
    fn assess(&self) {
        let observations = self.registry.observations();
        let (decision, initialized) = {
            let view = self.view.read();
            (
                self.quorum.decide_by_agreement(&observations, &view),
                view.initialized,
            )
        };

        match decision {
            Decision::Available(address) => self.apply_available(address),
            // Until the initial assessment an empty view waits for more reports
            Decision::Unavailable if !initialized && !self.settled.load(Ordering::Acquire) => {
                log::debug!(
                    "No quorum for {} yet ({} observations)",
                    self.master_name,
                    observations.len()
                );
            }
            Decision::Unavailable => self.apply_unavailable(),
            Decision::NoChange => {}
        }
    }

    fn apply_available(&self, address: Endpoint) {
        let was_healthy = {
            let mut view = self.view.write();
            if view.address.as_ref() == Some(&address) && view.healthy {
                return;
            }
            let was_healthy = view.healthy;
            view.set_available(address.clone());
            self.manager.rebind(&address);
            was_healthy
        };

        log::info!("Master {} available at {}", self.master_name, address);
        self.emit(CoordinatorEvent::MasterAvailable(address));
        if !was_healthy {
            self.emit(CoordinatorEvent::HealthyChange(true));
        }
    }

    fn apply_unavailable(&self) {
        let was_healthy = {
            let mut view = self.view.write();
            if view.suspended {
                return;
            }
            let was_healthy = view.healthy;
            view.set_suspended();
            self.manager.suspend_all();
            was_healthy
        };

        log::warn!("Master {} not available", self.master_name);
        self.emit(CoordinatorEvent::MasterUnavailable);
        if was_healthy {
            self.emit(CoordinatorEvent::HealthyChange(false));
        }

        // Look for a promoted replica right away
        self.spawn_fresh_round();
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Start a fresh-query round unless one is already running
    fn spawn_fresh_round(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.round_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }

        let snapshot = self.registry.list();
        let master_name = self.master_name.clone();
        let connect = self.options.connect_options();
        let round_timeout = self.options.round_timeout;
        let debug = self.options.debug;
        let signals = self.signals.clone();
        let in_progress = self.round_in_progress.clone();

        self.track(tokio::spawn(async move {
            let elected = QuorumEngine::majority_fresh_query(
                &snapshot,
                &master_name,
                connect,
                round_timeout,
                debug,
            )
            .await;
            in_progress.store(false, Ordering::Release);
            let _ = signals.send(Signal::Confirmed(elected));
        }));
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        if self.stopped.load(Ordering::Acquire) {
            handle.abort();
            return;
        }
        tasks.push(handle);
    }
}

/// Count the seeds that accept a connection
async fn probe_seeds(seeds: &[Endpoint], connect: &ConnectOptions, debug: bool) -> usize {
    let mut probes = JoinSet::new();
    for seed in seeds {
        let seed = seed.clone();
        let connect = *connect;
        probes.spawn(async move {
            let result = Connection::open(&seed, &connect).await;
            (seed, result)
        });
    }

    let mut reachable = 0;
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((_, Ok(conn))) => {
                conn.close().await;
                reachable += 1;
            }
            Ok((seed, Err(e))) => crate::sentinel::log_peer_error(debug, &seed, "probe", &e),
            Err(e) => log::debug!("Seed probe task failed: {}", e),
        }
    }
    reachable
}

fn spawn_dedup_sweeper(dedup: Arc<EventDeduplicator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            let pruned = dedup.prune(current_time_ms());
            if pruned > 0 {
                log::trace!("Pruned {} expired event keys", pruned);
            }
        }
    })
}

/// Resolve an uninitialized view even if no sentinel ever changes state
fn spawn_initial_assessment(
    signals: mpsc::UnboundedSender<Signal>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = signals.send(Signal::Reassess);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::state::{MasterStatus, ObservedMaster};
    use tokio::net::TcpListener;

    /// Accepts connections and never answers
    async fn mute_sentinel() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    async fn closed_port() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    fn quiet_options() -> CoordinatorOptions {
        CoordinatorOptions {
            read_timeout: Duration::from_millis(100),
            round_timeout: Duration::from_millis(300),
            initial_assess_delay: Duration::from_secs(3600),
            ..CoordinatorOptions::default()
        }
    }

    #[tokio::test]
    async fn test_start_fails_without_reachable_seed() {
        let seeds = vec![closed_port().await, closed_port().await];
        let result = Coordinator::start("mymaster", seeds, quiet_options()).await;
        assert!(matches!(result, Err(Error::NoSentinelReachable(2))));
    }

    #[tokio::test]
    async fn test_start_validates_input() {
        assert!(matches!(
            Coordinator::start("", vec![Endpoint::new("127.0.0.1", 1)], quiet_options()).await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Coordinator::start("mymaster", vec![], quiet_options()).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_quorum_defaults_to_seed_majority() {
        let seeds = vec![
            mute_sentinel().await,
            mute_sentinel().await,
            mute_sentinel().await,
        ];
        let coordinator = Coordinator::start("mymaster", seeds.clone(), quiet_options())
            .await
            .unwrap();

        assert_eq!(coordinator.quorum(), 2);
        assert_eq!(coordinator.sentinels().len(), 3);
        assert!(!coordinator.is_healthy());
        assert_eq!(coordinator.master().address, None);

        // Duplicate add is a no-op
        assert!(!coordinator.add_sentinel(seeds[0].clone()));
        assert!(coordinator.remove_sentinel(&seeds[0]));
        assert_eq!(coordinator.sentinels().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_clients() {
        let coordinator =
            Coordinator::start("mymaster", vec![mute_sentinel().await], quiet_options())
                .await
                .unwrap();
        let client = coordinator
            .create_master_client(MasterClientOptions::default())
            .unwrap();

        coordinator.stop();
        coordinator.stop();

        assert!(coordinator.is_stopped());
        assert!(client.is_closed());
        assert!(coordinator.sentinels().is_empty());
        assert!(!coordinator.add_sentinel(Endpoint::new("127.0.0.1", 26379)));
        assert!(matches!(
            coordinator.create_master_client(MasterClientOptions::default()),
            Err(Error::Stopped)
        ));
        assert!(matches!(coordinator.confirm_master().await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn test_notifications_drive_view_and_events() {
        let coordinator =
            Coordinator::start("mymaster", vec![mute_sentinel().await], quiet_options())
                .await
                .unwrap();
        let mut events = coordinator.subscribe();
        let inner = &coordinator.inner;

        inner.handle(Signal::Notification(Notification::MasterAvailable(
            Endpoint::new("10.0.0.2", 6379),
        )));
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::MasterAvailable(Endpoint::new("10.0.0.2", 6379))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::HealthyChange(true)
        );
        assert!(coordinator.is_healthy());

        // Repeated switch to the same address is not re-announced
        inner.handle(Signal::Notification(Notification::MasterAvailable(
            Endpoint::new("10.0.0.2", 6379),
        )));

        inner.handle(Signal::Notification(Notification::HealthyChange(false)));
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::HealthyChange(false)
        );
        assert!(!coordinator.is_healthy());
        assert!(!coordinator.master().suspended);

        // No master confirmed after the odown
        inner.handle(Signal::Confirmed(None));
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::MasterUnavailable
        );
        assert!(coordinator.master().suspended);

        inner.handle(Signal::Confirmed(Some(Endpoint::new("10.0.0.3", 6379))));
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::MasterAvailable(Endpoint::new("10.0.0.3", 6379))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::HealthyChange(true)
        );
    }

    #[tokio::test]
    async fn test_assess_over_registry_snapshot() {
        let seeds = vec![
            mute_sentinel().await,
            mute_sentinel().await,
            mute_sentinel().await,
        ];
        let coordinator = Coordinator::start("mymaster", seeds.clone(), quiet_options())
            .await
            .unwrap();
        let client = coordinator
            .create_master_client(MasterClientOptions::default())
            .unwrap();
        let inner = &coordinator.inner;

        let master = Endpoint::new("10.0.0.1", 6379);
        for seed in &seeds[..2] {
            inner.registry.get(seed).unwrap().update_observed(ObservedMaster {
                address: master.clone(),
                status: MasterStatus::Ok,
            });
        }
        inner.handle(Signal::Reassess);

        assert_eq!(coordinator.master().address, Some(master.clone()));
        assert_eq!(client.bound_address(), Some(master.clone()));

        // Every sentinel now reports it objectively down
        for seed in &seeds {
            inner.registry.get(seed).unwrap().update_observed(ObservedMaster {
                address: master.clone(),
                status: MasterStatus::ODown,
            });
        }
        inner.handle(Signal::Reassess);

        assert!(coordinator.master().suspended);
        assert!(matches!(
            client.command(&[b"PING"]).await,
            Err(Error::MasterUnavailable)
        ));
    }
}
