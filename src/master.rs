//! Master connection management
//!
//! Application-facing connections bound to whichever address the coordinator
//! currently believes is the master. Each client follows a small state
//! machine driven by the coordinator's decisions:
//!
//! ```text
//! Unbound ──available──▶ Bound(addr) ──unavailable──▶ Suspended
//!                           ▲    │                         │
//!                           │    └──available(new addr)──┐ │
//!                           └─────────────────────────────┴─┘
//! ```
//!
//! A rebind drops the underlying session and redials the new address
//! eagerly. While suspended every request, including those already in
//! flight, fails with `Error::MasterUnavailable`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};

use crate::config::MasterClientOptions;
use crate::connection::{ConnectOptions, Connection};
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::sentinel::state::{Endpoint, current_time_ms};

/// The coordinator's current belief about the master
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterView {
    /// Empty until the first successful discovery
    pub address: Option<Endpoint>,
    pub healthy: bool,
    /// `masterUnavailable` was announced and no master has been elected since
    pub suspended: bool,
    /// Set once the first decision (available or unavailable) was made
    pub initialized: bool,
    /// Unix ms of the last change
    pub last_changed_at: Option<u64>,
}

impl MasterView {
    pub(crate) fn set_available(&mut self, address: Endpoint) {
        self.address = Some(address);
        self.healthy = true;
        self.suspended = false;
        self.initialized = true;
        self.last_changed_at = Some(current_time_ms());
    }

    /// Master reported down; clients stay bound until it is confirmed
    pub(crate) fn set_unhealthy(&mut self) {
        self.healthy = false;
        self.last_changed_at = Some(current_time_ms());
    }

    /// No safe master can be determined
    pub(crate) fn set_suspended(&mut self) {
        self.healthy = false;
        self.suspended = true;
        self.initialized = true;
        self.last_changed_at = Some(current_time_ms());
    }
}

/// Binding state of one master client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No master known yet
    Unbound,
    Bound(Endpoint),
    /// No safe master; requests fail fast
    Suspended,
    Closed,
}

struct ClientShared {
    id: u64,
    state: watch::Sender<LinkState>,
    conn: Mutex<Option<Connection>>,
    dials: AtomicU64,
    options: ConnectOptions,
}

impl ClientShared {
    fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Move to `next` unless closed; returns true if the state changed
    fn transition(&self, next: LinkState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    async fn dial(&self, target: &Endpoint) -> Result<Connection> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::open(target, &self.options).await?;
        log::debug!("Master client {} connected to {}", self.id, target);
        Ok(conn)
    }

    /// Drop any session to a stale address and dial `target`
    async fn redial(&self, target: Endpoint) {
        let mut conn = self.conn.lock().await;

        // Superseded by a later transition while waiting for the lock
        if self.state() != LinkState::Bound(target.clone()) {
            return;
        }
        if conn.as_ref().is_some_and(|c| c.endpoint() == &target) {
            return;
        }

        *conn = None;
        match self.dial(&target).await {
            Ok(c) => *conn = Some(c),
            Err(e) => log::warn!(
                "Master client {} failed to connect to {}: {}",
                self.id,
                target,
                e
            ),
        }
    }

    /// Drop the session if nobody is using it
    fn drop_idle_connection(&self) {
        if let Ok(mut conn) = self.conn.try_lock() {
            *conn = None;
        }
    }
}

type ClientSet = Arc<DashMap<u64, Arc<ClientShared>>>;

/// One application-facing connection to the current master
pub struct MasterClient {
    shared: Arc<ClientShared>,
    clients: ClientSet,
}

enum Outcome {
    Done(Result<RespValue>),
    Interrupted(LinkState),
}

impl MasterClient {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Address this client is bound to, if any
    pub fn bound_address(&self) -> Option<Endpoint> {
        match self.shared.state() {
            LinkState::Bound(address) => Some(address),
            _ => None,
        }
    }

    /// Number of connection attempts made so far
    pub fn dial_count(&self) -> u64 {
        self.shared.dials.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state() == LinkState::Closed
    }

    /// Run one command against the bound master.
    ///
    /// Fails with `MasterUnavailable` while suspended, also for a request
    /// that was in flight when the master was lost. The session is dialed
    /// lazily if the eager redial didn't happen or failed.
    pub async fn command(&self, args: &[&[u8]]) -> Result<RespValue> {
        // Fail fast without queueing behind a redial
        bound_target(&self.shared.state())?;

        let mut state_rx = self.shared.state.subscribe();
        let mut conn = self.shared.conn.lock().await;

        let target = bound_target(&state_rx.borrow_and_update())?;

        if conn.as_ref().is_some_and(|c| c.endpoint() != &target) {
            *conn = None;
        }

        let outcome = {
            let exec = async {
                if conn.is_none() {
                    *conn = Some(self.shared.dial(&target).await?);
                }
                match conn.as_mut() {
                    Some(c) => c.command(args).await,
                    None => Err(Error::ConnectionClosed(target.to_string())),
                }
            };

            tokio::select! {
                result = exec => Outcome::Done(result),
                changed = state_rx.changed() => match changed {
                    Ok(()) => Outcome::Interrupted(state_rx.borrow().clone()),
                    Err(_) => Outcome::Interrupted(LinkState::Closed),
                },
            }
        };

        match outcome {
            Outcome::Done(Ok(reply)) => Ok(reply),
            Outcome::Done(Err(e)) => {
                if e.is_connection_error() {
                    *conn = None;
                }
                Err(e)
            }
            Outcome::Interrupted(state) => {
                // The reply, if any, belongs to a session we no longer trust
                *conn = None;
                Err(match state {
                    LinkState::Suspended => Error::MasterUnavailable,
                    LinkState::Closed => Error::ClientClosed,
                    LinkState::Unbound => Error::NoMasterKnown,
                    LinkState::Bound(_) => Error::ConnectionClosed(target.to_string()),
                })
            }
        }
    }

    /// Close the client and release its session
    pub fn close(&self) {
        self.shared.state.send_replace(LinkState::Closed);
        self.shared.drop_idle_connection();
        self.clients.remove(&self.shared.id);
    }
}

fn bound_target(state: &LinkState) -> Result<Endpoint> {
    match state {
        LinkState::Bound(address) => Ok(address.clone()),
        LinkState::Unbound => Err(Error::NoMasterKnown),
        LinkState::Suspended => Err(Error::MasterUnavailable),
        LinkState::Closed => Err(Error::ClientClosed),
    }
}

impl Drop for MasterClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MasterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterClient")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Owner of every live master client
#[derive(Default)]
pub struct MasterConnectionManager {
    clients: ClientSet,
    next_id: AtomicU64,
}

impl MasterConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// New client bound to the current view.
    ///
    /// Unbound if no master is known yet, suspended while no safe master can
    /// be determined.
    pub fn create(&self, view: &MasterView, options: &MasterClientOptions) -> MasterClient {
        let initial = match &view.address {
            _ if view.suspended => LinkState::Suspended,
            Some(address) => LinkState::Bound(address.clone()),
            None => LinkState::Unbound,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (state, _) = watch::channel(initial);
        let shared = Arc::new(ClientShared {
            id,
            state,
            conn: Mutex::new(None),
            dials: AtomicU64::new(0),
            options: options.connect_options(),
        });
        self.clients.insert(id, shared.clone());
        log::debug!("Master client {} created ({:?})", id, shared.state());

        MasterClient {
            shared,
            clients: self.clients.clone(),
        }
    }

    /// Repoint every client at `address` and redial it.
    ///
    /// Clients already bound to `address` are left untouched. Must be called
    /// from within a tokio runtime.
    pub fn rebind(&self, address: &Endpoint) -> usize {
        let mut rebound = 0;
        for entry in self.clients.iter() {
            let shared = entry.value().clone();
            if !shared.transition(LinkState::Bound(address.clone())) {
                continue;
            }
            rebound += 1;
            let target = address.clone();
            tokio::spawn(async move {
                shared.redial(target).await;
            });
        }
        if rebound > 0 {
            log::info!("Rebound {} master client(s) to {}", rebound, address);
        }
        rebound
    }

    /// Fail every client fast until the next rebind
    pub fn suspend_all(&self) -> usize {
        let mut suspended = 0;
        for entry in self.clients.iter() {
            if entry.value().transition(LinkState::Suspended) {
                entry.value().drop_idle_connection();
                suspended += 1;
            }
        }
        if suspended > 0 {
            log::warn!("Suspended {} master client(s): master not available", suspended);
        }
        suspended
    }

    /// Close and forget every client
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().state.send_replace(LinkState::Closed);
            entry.value().drop_idle_connection();
        }
        self.clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Server answering +PONG to every read
    async fn fake_master() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 || socket.write_all(b"+PONG\r\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    /// Server that accepts and never answers
    async fn silent_master() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    fn view_at(address: &Endpoint) -> MasterView {
        let mut view = MasterView::default();
        view.set_available(address.clone());
        view
    }

    async fn wait_for_dials(client: &MasterClient, n: u64) {
        for _ in 0..100 {
            if client.dial_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_unbound_client_fails_until_master_known() {
        let manager = MasterConnectionManager::new();
        let client = manager.create(&MasterView::default(), &MasterClientOptions::default());

        assert_eq!(client.state(), LinkState::Unbound);
        assert!(matches!(
            client.command(&[b"PING"]).await,
            Err(Error::NoMasterKnown)
        ));
    }

    #[tokio::test]
    async fn test_rebind_redials_exactly_once() {
        let first = fake_master().await;
        let second = fake_master().await;
        let manager = MasterConnectionManager::new();
        let client = manager.create(&view_at(&first), &MasterClientOptions::default());

        let reply = client.command(&[b"PING"]).await.unwrap();
        assert_eq!(reply.to_text().unwrap(), "PONG");
        assert_eq!(client.dial_count(), 1);

        assert_eq!(manager.rebind(&second), 1);
        assert_eq!(client.bound_address(), Some(second.clone()));
        wait_for_dials(&client, 2).await;

        client.command(&[b"PING"]).await.unwrap();
        assert_eq!(client.dial_count(), 2);

        // Same address again is a no-op
        assert_eq!(manager.rebind(&second), 0);
        assert_eq!(client.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_suspend_fails_in_flight_and_new_requests() {
        let master = silent_master().await;
        let manager = Arc::new(MasterConnectionManager::new());
        let options = MasterClientOptions {
            read_timeout: Duration::from_secs(30),
            ..MasterClientOptions::default()
        };
        let client = Arc::new(manager.create(&view_at(&master), &options));

        let in_flight = {
            let client = client.clone();
            tokio::spawn(async move { client.command(&[b"GET", b"k"]).await })
        };
        wait_for_dials(&client, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.suspend_all(), 1);

        let result = tokio::time::timeout(Duration::from_secs(2), in_flight)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::MasterUnavailable)));
        assert!(matches!(
            client.command(&[b"PING"]).await,
            Err(Error::MasterUnavailable)
        ));

        // Recovery at the same address
        let recovered = fake_master().await;
        manager.rebind(&recovered);
        wait_for_dials(&client, 2).await;
        assert!(client.command(&[b"PING"]).await.is_ok());
    }

    #[tokio::test]
    async fn test_suspended_view_creates_suspended_client() {
        let manager = MasterConnectionManager::new();
        let mut view = view_at(&Endpoint::new("10.0.0.1", 6379));

        view.set_unhealthy();
        let bound = manager.create(&view, &MasterClientOptions::default());
        assert_eq!(
            bound.state(),
            LinkState::Bound(Endpoint::new("10.0.0.1", 6379))
        );

        view.set_suspended();
        let client = manager.create(&view, &MasterClientOptions::default());
        assert_eq!(client.state(), LinkState::Suspended);
    }

    #[tokio::test]
    async fn test_close_removes_client() {
        let manager = MasterConnectionManager::new();
        let a = manager.create(&MasterView::default(), &MasterClientOptions::default());
        let b = manager.create(&MasterView::default(), &MasterClientOptions::default());
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.len(), 2);

        a.close();
        assert!(a.is_closed());
        assert_eq!(manager.len(), 1);

        drop(b);
        assert!(manager.is_empty());

        assert!(matches!(a.command(&[b"PING"]).await, Err(Error::ClientClosed)));
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = MasterConnectionManager::new();
        let client = manager.create(
            &view_at(&Endpoint::new("10.0.0.1", 6379)),
            &MasterClientOptions::default(),
        );

        manager.close_all();
        assert!(client.is_closed());
        assert!(manager.is_empty());
        // Closed clients are never rebound
        assert_eq!(manager.rebind(&Endpoint::new("10.0.0.2", 6379)), 0);
    }
}
