//! Offline caching and background synchronization engine.
//!
//! driftcache keeps an application usable without connectivity: intercepted
//! GET requests are answered through per-class cache strategies backed by
//! named, versioned partitions; mutating requests made while offline land in
//! a durable queue and are replayed when connectivity returns; a worker with
//! an install/update lifecycle keeps the cached content current.
//!
//! [`Coordinator`] is the entry point. Construct it with a [`net::Network`]
//! implementation, a [`notify::Notifier`], and a [`notify::PageReload`], then
//! call [`Coordinator::register`].

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod net;
pub mod notify;
pub mod strategy;
pub mod sync;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheLifecycle, ClearCacheOutcome, PartitionPurpose};
pub use config::{Config, EngineConfig, APP_NAME};
pub use coordinator::{Capabilities, Coordinator};
pub use error::EngineError;
pub use http::{Method, Request, Response};
pub use net::{HttpNetwork, Network, NetworkStatus};
pub use notify::{LogNotifier, LogReload, Notification, Notifier, PageReload, Severity};
pub use strategy::{FetchOutcome, StrategyKind};
pub use sync::{QueuedMutation, ReplayReport, SyncQueue};
pub use worker::{ControlMessage, LifecycleEvent, LifecycleState, Worker, WorkerReply, SYNC_TAG};
