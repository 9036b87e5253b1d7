//! Partition lifecycle: install-time pre-population, activation cleanup, and
//! periodic eviction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::cache::partition::{
    partition_name, CachePartition, EvictionPolicy, PartitionPurpose,
};
use crate::config::EngineConfig;
use crate::http::Request;
use crate::net::Network;

/// Partitions that hold accumulating runtime entries and therefore get the
/// eviction sweep. Static, fonts, images and offline content are bounded by
/// the pre-cache manifest and page assets instead.
const EVICTABLE: [PartitionPurpose; 2] = [PartitionPurpose::Dynamic, PartitionPurpose::Documents];

/// Outcome of a full cache wipe, reported distinctly so callers can tell
/// partial failure from storage being unavailable altogether.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearCacheOutcome {
    Cleared,
    Partial { failed: usize },
    Unavailable,
}

/// Owns the six current partitions and their install/activate/cleanup
/// behavior.
pub struct CacheLifecycle {
    root: PathBuf,
    config: Arc<EngineConfig>,
    network: Arc<dyn Network>,
    partitions: HashMap<PartitionPurpose, Arc<CachePartition>>,
}

impl CacheLifecycle {
    pub fn new(root: &Path, config: Arc<EngineConfig>, network: Arc<dyn Network>) -> Self {
        let partitions = PartitionPurpose::ALL
            .iter()
            .map(|&purpose| {
                let partition = Arc::new(CachePartition::new(
                    root,
                    &config.app_name,
                    purpose,
                    config.cache_version,
                ));
                (purpose, partition)
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            config,
            network,
            partitions,
        }
    }

    /// The current partition for a purpose. Exactly one exists per purpose.
    pub fn partition(&self, purpose: PartitionPurpose) -> Arc<CachePartition> {
        Arc::clone(&self.partitions[&purpose])
    }

    fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            entry_threshold: self.config.eviction_entry_threshold,
            max_age: Duration::minutes(self.config.max_entry_age_minutes),
            size_budget_bytes: self.config.size_budget_bytes,
            cleanup_percent: self.config.cleanup_percent,
        }
    }

    /// Install-time pre-population. Installation is complete only when both
    /// the static manifest and the offline fallbacks are fully cached; any
    /// failure propagates so the hosting runtime can retry the install.
    pub async fn install(&self) -> Result<()> {
        let offline_urls = [
            self.config.offline_document_url.clone(),
            self.config.offline_image_url.clone(),
        ];
        let (static_res, offline_res) = tokio::join!(
            self.populate(PartitionPurpose::Static, &self.config.precache_manifest),
            self.populate(PartitionPurpose::Offline, &offline_urls),
        );
        static_res.context("Failed to pre-cache static manifest")?;
        offline_res.context("Failed to pre-cache offline fallbacks")?;
        info!(
            manifest = self.config.precache_manifest.len(),
            "Install pre-cache complete"
        );
        Ok(())
    }

    /// Fetch and store every URL into the partition. Fails on the first URL
    /// that cannot be fetched with a success status.
    async fn populate(&self, purpose: PartitionPurpose, urls: &[String]) -> Result<()> {
        let partition = self.partition(purpose);
        for url in urls {
            let request = Request::get(url.clone());
            let response = self
                .network
                .fetch(&request)
                .await
                .with_context(|| format!("Pre-cache fetch failed for {}", url))?;
            if !response.is_success() {
                anyhow::bail!("Pre-cache fetch for {} returned status {}", url, response.status);
            }
            partition.put(&request, &response).await?;
        }
        Ok(())
    }

    /// Activation housekeeping: drop stale-named partitions from older
    /// versions, then run the eviction sweep on the accumulating partitions.
    pub async fn activate(&self) -> Result<()> {
        let removed = self.cleanup_stale_partitions()?;
        if removed > 0 {
            info!(removed, "Removed stale partitions");
        }
        self.evict_all().await;
        Ok(())
    }

    /// Delete any stored partition whose name is not one of the six current
    /// names. Only the directory enumeration itself is fatal; individual
    /// deletions are attempted to completion.
    fn cleanup_stale_partitions(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let current: Vec<String> = PartitionPurpose::ALL
            .iter()
            .map(|&p| partition_name(&self.config.app_name, p, self.config.cache_version))
            .collect();
        let prefix = format!("{}-", self.config.app_name);

        let dir = std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to enumerate cache names in {:?}", self.root))?;

        let mut removed = 0;
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Only files following the partition naming scheme are ours to
            // manage; the sync queue and other storage live alongside them.
            if !stem.starts_with(&prefix) || !stem.contains("-v") {
                continue;
            }
            if current.iter().any(|name| name == stem) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(partition = stem, "Deleted stale partition");
                    removed += 1;
                }
                Err(e) => {
                    warn!(partition = stem, error = %e, "Failed to delete stale partition");
                }
            }
        }
        Ok(removed)
    }

    /// Run the eviction sweep on the dynamic and documents partitions.
    /// Per-partition failures are logged; the sweep always visits all of
    /// them.
    pub async fn evict_all(&self) {
        let policy = self.eviction_policy();
        for purpose in EVICTABLE {
            let partition = self.partition(purpose);
            match partition.evict(&policy).await {
                Ok(stats) if stats.total() > 0 => {
                    info!(
                        partition = partition.name(),
                        removed = stats.total(),
                        "Evicted entries"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(partition = partition.name(), error = %e, "Eviction failed");
                }
            }
        }
    }

    /// Re-populate the static partition from the pre-cache manifest.
    pub async fn update_static(&self) -> Result<()> {
        self.populate(PartitionPurpose::Static, &self.config.precache_manifest)
            .await
    }

    /// Delete partitions, optionally sparing the offline fallbacks. Reports
    /// how many deletions were attempted and how many failed.
    pub async fn clear(&self, keep_offline: bool) -> ClearCacheOutcome {
        if !self.root.exists() {
            return ClearCacheOutcome::Unavailable;
        }
        let targets: Vec<Arc<CachePartition>> = self
            .partitions
            .values()
            .filter(|p| !(keep_offline && p.purpose() == PartitionPurpose::Offline))
            .map(Arc::clone)
            .collect();

        let results = join_all(targets.iter().map(|p| p.destroy())).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        for (partition, result) in targets.iter().zip(&results) {
            if let Err(e) = result {
                warn!(partition = partition.name(), error = %e, "Failed to delete partition");
            }
        }
        if failed == 0 {
            ClearCacheOutcome::Cleared
        } else {
            ClearCacheOutcome::Partial { failed }
        }
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
    use tempfile::TempDir;

    fn test_config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            precache_manifest: vec!["/".to_string(), "/index.html".to_string()],
            ..EngineConfig::default()
        })
    }

    fn lifecycle(dir: &TempDir, network: Arc<MockNetwork>) -> CacheLifecycle {
        CacheLifecycle::new(dir.path(), test_config(), network)
    }

    #[tokio::test]
    async fn test_install_populates_static_and_offline() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        network.route("/", Response::with_body(200, b"root".to_vec()));
        network.route("/index.html", Response::with_body(200, b"index".to_vec()));
        network.route("/offline.html", Response::with_body(200, b"offline".to_vec()));
        network.route("/offline.svg", Response::with_body(200, b"<svg/>".to_vec()));

        let caches = lifecycle(&dir, network);
        caches.install().await.unwrap();
        caches.activate().await.unwrap();

        let statics = caches.partition(PartitionPurpose::Static);
        assert!(statics.match_request(&Request::get("/")).await.unwrap().is_some());
        assert!(statics
            .match_request(&Request::get("/index.html"))
            .await
            .unwrap()
            .is_some());
        let offline = caches.partition(PartitionPurpose::Offline);
        assert!(offline
            .match_request(&Request::get("/offline.html"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_install_fails_when_manifest_fetch_fails() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        network.route("/", Response::with_body(200, b"root".to_vec()));
        // "/index.html" unrouted -> fetch error
        network.route("/offline.html", Response::new(200));
        network.route("/offline.svg", Response::new(200));

        let caches = lifecycle(&dir, network);
        assert!(caches.install().await.is_err());
    }

    #[tokio::test]
    async fn test_install_fails_on_non_success_status() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        network.route("/", Response::new(404));
        network.route("/index.html", Response::new(200));
        network.route("/offline.html", Response::new(200));
        network.route("/offline.svg", Response::new(200));

        let caches = lifecycle(&dir, network);
        assert!(caches.install().await.is_err());
    }

    #[tokio::test]
    async fn test_activation_deletes_stale_partitions() {
        let dir = TempDir::new().unwrap();
        // A leftover v0 partition and an unrelated storage file.
        std::fs::write(dir.path().join("driftcache-static-v0.json"), "{}").unwrap();
        std::fs::write(dir.path().join("sync-queue.json"), "[]").unwrap();

        let network = Arc::new(MockNetwork::new());
        let caches = lifecycle(&dir, network);
        caches.activate().await.unwrap();

        assert!(!dir.path().join("driftcache-static-v0.json").exists());
        assert!(dir.path().join("sync-queue.json").exists());
    }

    #[tokio::test]
    async fn test_current_partitions_survive_activation() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let caches = lifecycle(&dir, network);

        let statics = caches.partition(PartitionPurpose::Static);
        statics
            .put(&Request::get("/app.js"), &Response::new(200))
            .await
            .unwrap();
        caches.activate().await.unwrap();
        assert_eq!(statics.entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_offline_when_asked() {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(MockNetwork::new());
        let caches = lifecycle(&dir, network);

        caches
            .partition(PartitionPurpose::Offline)
            .put(&Request::get("/offline.html"), &Response::new(200))
            .await
            .unwrap();
        caches
            .partition(PartitionPurpose::Dynamic)
            .put(&Request::get("/api/x"), &Response::new(200))
            .await
            .unwrap();

        let outcome = caches.clear(true).await;
        assert_eq!(outcome, ClearCacheOutcome::Cleared);
        assert_eq!(
            caches
                .partition(PartitionPurpose::Offline)
                .entry_count()
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            caches
                .partition(PartitionPurpose::Dynamic)
                .entry_count()
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_clear_unavailable_without_storage_root() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let network = Arc::new(MockNetwork::new());
        let caches = CacheLifecycle::new(&missing, test_config(), network);
        assert_eq!(caches.clear(false).await, ClearCacheOutcome::Unavailable);
    }
}
