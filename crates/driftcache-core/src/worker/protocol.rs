//! Page-to-worker control protocol.
//!
//! Modeled as closed tagged unions with a single dispatch match on each side
//! so the protocol stays exhaustively checkable.

use serde::{Deserialize, Serialize};

/// Background sync tag identifying the mutation-replay trigger.
pub const SYNC_TAG: &str = "driftcache-replay";

/// Messages the page sends to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate a waiting worker immediately.
    SkipWaiting,
    /// Take control of open pages.
    ClaimClients,
    /// Re-populate the static partition from the pre-cache manifest.
    UpdateCaches,
    /// Delete all partitions except offline, then repopulate static.
    ClearCaches,
}

/// Replies the worker sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    CacheUpdated,
    CachesCleared,
}
