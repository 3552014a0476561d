//! Client-side failover coordination for sentinel-monitored masters.
//!
//! The coordinator discovers the sentinel set from a few seeds, decides the
//! current master by quorum, follows failovers through polling and/or the
//! sentinels' event channels, and keeps application connections pointed at
//! the right node (or failing fast while there is none).

pub mod cli;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod master;
pub mod protocol;
pub mod sentinel;

pub use config::{CoordinatorOptions, FailoverConfig, MasterClientOptions, WatchStrategy};
pub use coordinator::{Coordinator, CoordinatorEvent};
pub use error::{Error, Result};
pub use master::{LinkState, MasterClient, MasterView};
pub use sentinel::Endpoint;
