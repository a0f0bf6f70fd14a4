//! Offline-aware record store for the hospital maintenance-request app.
//!
//! A [`RecordStore`] mediates between a remote document database (any
//! [`RemoteStore`]) and local consumers. It mirrors every record it sees in a
//! local cache, queues writes made while offline in a durable log, replays them
//! in order on reconnect, and fans realtime changes out to observers.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod domain;
pub mod error;
pub mod event;
pub mod logging;
pub mod queue;
pub mod record;
pub mod remote;
pub mod store;
pub mod subscription;

pub use cache::{Source, Sourced};
pub use config::Config;
pub use connectivity::{ConnectionStatus, Connectivity, NetworkSignal};
pub use error::{RemoteError, StoreError, StoreResult};
pub use event::StoreEvent;
pub use record::{ChangeSet, Collection, Fields, Filter, FilterOp, OrderBy, Record};
pub use remote::{MemoryRemote, RemoteStore};
pub use store::{RecordStore, StoreOptions};
pub use subscription::{observer, ChangeObserver, SubscriptionHandle};
