//! Durable queue for mutating requests made while offline.
//!
//! Mutations are persisted as a JSON array under a single storage key and
//! replayed in enqueue order when connectivity returns. An entry leaves the
//! queue only after a confirmed successful replay; failures stay queued for
//! the next trigger. All queue mutations go through one in-process mutex, so
//! a replay triggered by the connectivity monitor and one triggered by a
//! background-sync signal can run concurrently without losing updates.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::http::{Method, Request};
use crate::net::Network;

/// File name holding the persisted queue, the single storage key.
const QUEUE_FILE: &str = "sync-queue.json";

/// A state-changing request that could not be sent when issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: u64,
    pub url: String,
    pub method: Method,
    pub body: Value,
    pub timestamp: DateTime<Utc>,
}

impl QueuedMutation {
    fn to_request(&self) -> Request {
        let mut request = Request::new(self.method, self.url.clone())
            .with_header("content-type", "application/json");
        if !self.body.is_null() {
            request.body = Some(self.body.to_string().into_bytes());
        }
        request
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub remaining: usize,
}

pub struct SyncQueue {
    path: PathBuf,
    network: Arc<dyn Network>,
    /// Serializes every load-mutate-save of the queue file.
    lock: Mutex<()>,
}

impl SyncQueue {
    pub fn new(root: &Path, network: Arc<dyn Network>) -> Self {
        Self {
            path: root.join(QUEUE_FILE),
            network,
            lock: Mutex::new(()),
        }
    }

    /// Append a mutation and persist it immediately. When the device is
    /// online, a direct submission is attempted right away rather than
    /// waiting for a replay trigger; on success the entry is removed again.
    pub async fn enqueue(
        &self,
        url: impl Into<String>,
        method: Method,
        body: Value,
        online: bool,
    ) -> Result<QueuedMutation> {
        let mutation = {
            let _guard = self.lock.lock().await;
            let mut queue = self.load_queue();
            let id = queue.iter().map(|m| m.id).max().unwrap_or(0) + 1;
            let mutation = QueuedMutation {
                id,
                url: url.into(),
                method,
                body,
                timestamp: Utc::now(),
            };
            queue.push(mutation.clone());
            self.save_queue(&queue)?;
            mutation
        };
        debug!(id = mutation.id, url = %mutation.url, "Queued mutation");

        if online && self.attempt(&mutation).await {
            self.remove_ids(&HashSet::from([mutation.id])).await?;
            debug!(id = mutation.id, "Direct submission succeeded");
        }
        Ok(mutation)
    }

    /// Attempt every queued entry and drop exactly the confirmed successes.
    ///
    /// Entries are attempted in enqueue order but independently and
    /// concurrently: one failure never blocks the next attempt. Safe to
    /// trigger from multiple places at once; an entry already removed by a
    /// concurrent replay is simply no longer enumerated.
    pub async fn replay(&self) -> Result<ReplayReport> {
        let snapshot = {
            let _guard = self.lock.lock().await;
            self.load_queue()
        };
        if snapshot.is_empty() {
            return Ok(ReplayReport::default());
        }

        let attempts = join_all(snapshot.iter().map(|m| self.attempt(m))).await;
        let succeeded: HashSet<u64> = snapshot
            .iter()
            .zip(&attempts)
            .filter(|(_, ok)| **ok)
            .map(|(m, _)| m.id)
            .collect();

        let remaining = self.remove_ids(&succeeded).await?;
        let report = ReplayReport {
            attempted: snapshot.len(),
            succeeded: succeeded.len(),
            remaining,
        };
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            remaining = report.remaining,
            "Replay pass complete"
        );
        Ok(report)
    }

    /// Number of entries currently persisted.
    pub async fn len(&self) -> usize {
        let _guard = self.lock.lock().await;
        self.load_queue().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the persisted queue, in enqueue order.
    pub async fn entries(&self) -> Vec<QueuedMutation> {
        let _guard = self.lock.lock().await;
        self.load_queue()
    }

    /// One resubmission attempt. Success means a response arrived with a
    /// success status; anything else leaves the entry queued.
    async fn attempt(&self, mutation: &QueuedMutation) -> bool {
        match self.network.fetch(&mutation.to_request()).await {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                debug!(id = mutation.id, status = response.status, "Replay attempt rejected");
                false
            }
            Err(e) => {
                debug!(id = mutation.id, error = %e, "Replay attempt failed");
                false
            }
        }
    }

    /// Remove the given ids from the persisted queue, returning how many
    /// entries remain.
    async fn remove_ids(&self, ids: &HashSet<u64>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut queue = self.load_queue();
        queue.retain(|m| !ids.contains(&m.id));
        self.save_queue(&queue)?;
        Ok(queue.len())
    }

    /// Read the persisted queue. A missing file is an empty queue; a corrupt
    /// or non-array value is discarded and treated as empty rather than
    /// propagated as an error.
    fn load_queue(&self) -> Vec<QueuedMutation> {
        if !self.path.exists() {
            return Vec::new();
        }
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "Failed to read sync queue");
                return Vec::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(queue) => queue,
            Err(e) => {
                warn!(error = %e, "Corrupt sync queue, discarding");
                let _ = std::fs::remove_file(&self.path);
                Vec::new()
            }
        }
    }

    fn save_queue(&self, queue: &[QueuedMutation]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string(queue)?;
        std::fs::write(&self.path, contents).context("Failed to write sync queue")?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::testutil::MockNetwork;
    use serde_json::json;
    use tempfile::TempDir;

    fn queue(dir: &TempDir, network: &Arc<MockNetwork>) -> SyncQueue {
        SyncQueue::new(dir.path(), Arc::clone(network) as Arc<dyn Network>)
    }

    #[tokio::test]
    async fn test_enqueue_offline_persists_without_network_call() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let q = queue(&dir, &network);

        q.enqueue("/api/x", Method::Post, json!({"a": 1}), false)
            .await
            .unwrap();

        assert_eq!(q.len().await, 1);
        assert_eq!(network.request_count(), 0);
        let entries = q.entries().await;
        assert_eq!(entries[0].url, "/api/x");
        assert_eq!(entries[0].body, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_enqueue_online_submits_directly() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        network.route("/api/x", Response::new(201));
        let q = queue(&dir, &network);

        q.enqueue("/api/x", Method::Post, json!({"a": 1}), true)
            .await
            .unwrap();

        assert_eq!(network.request_count(), 1);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_enqueue_online_keeps_entry_when_submission_fails() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        network.route("/api/x", Response::new(500));
        let q = queue(&dir, &network);

        q.enqueue("/api/x", Method::Post, json!({}), true).await.unwrap();
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let q = queue(&dir, &network);

        let a = q.enqueue("/api/a", Method::Post, json!({}), false).await.unwrap();
        let b = q.enqueue("/api/b", Method::Put, json!({}), false).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_replay_removes_exactly_accepted_entries() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let q = queue(&dir, &network);

        q.enqueue("/api/ok", Method::Post, json!({"n": 1}), false).await.unwrap();
        q.enqueue("/api/fail", Method::Post, json!({"n": 2}), false).await.unwrap();
        q.enqueue("/api/also-ok", Method::Delete, json!(null), false).await.unwrap();

        network.route("/api/ok", Response::new(200));
        network.route("/api/also-ok", Response::new(204));
        network.route("/api/fail", Response::new(503));

        let report = q.replay().await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.remaining, 1);

        let entries = q.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "/api/fail");
    }

    #[tokio::test]
    async fn test_replay_on_empty_queue_is_noop() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let q = queue(&dir, &network);
        let report = q.replay().await.unwrap();
        assert_eq!(report, ReplayReport::default());
        assert_eq!(network.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_entries_survive_for_next_trigger() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let q = queue(&dir, &network);

        q.enqueue("/api/x", Method::Post, json!({}), false).await.unwrap();
        network.set_offline(true);
        q.replay().await.unwrap();
        assert_eq!(q.len().await, 1);

        network.set_offline(false);
        network.route("/api/x", Response::new(200));
        q.replay().await.unwrap();
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_queue_discarded_as_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(QUEUE_FILE), "{\"not\": \"an array\"}").unwrap();
        let network = Arc::new(MockNetwork::new());
        let q = queue(&dir, &network);

        assert_eq!(q.len().await, 0);
        assert!(!dir.path().join(QUEUE_FILE).exists());
    }

    #[tokio::test]
    async fn test_replay_preserves_fifo_attempt_order() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let q = queue(&dir, &network);

        for i in 0..4 {
            q.enqueue(format!("/api/{}", i), Method::Post, json!({}), false)
                .await
                .unwrap();
        }
        q.replay().await.unwrap();

        let seen = network.requests();
        let expected: Vec<String> =
            (0..4).map(|i| format!("POST /api/{}", i)).collect();
        assert_eq!(seen, expected);
    }
}
