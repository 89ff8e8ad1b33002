//! Open-intel-delivery notifier.
//!
//! Streams, per operation, the deliveries that currently need manual dispatch
//! to websocket subscribers:
//!
//! - `dispatcher`: applies inbound bus events to the read model (`store`)
//! - `watcher`: recomputes one operation's snapshot on hints and ticks
//! - `hub`: fans a snapshot out to many listeners
//! - `controller`: one reference-counted watcher per operation
//! - `ws`: websocket endpoint and per-connection subscriptions

pub mod app;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod hub;
pub mod ready;
pub mod store;
pub mod watcher;
pub mod ws;

pub use app::{health_router, NotifierApp, CONSUMED_TOPICS};
pub use config::{ConfigError, NotifierConfig};
pub use controller::{ChangeNotifier, Controller, OpenDeliveries};
pub use dispatcher::Dispatcher;
pub use hub::{Listener, ListenerHandle, NotifyHub};
pub use store::{NotifierState, NotifierStore, MIGRATOR};
pub use watcher::{SnapshotSupplier, Watcher, WatcherConfig};
