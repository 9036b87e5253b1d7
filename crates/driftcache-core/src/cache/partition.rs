//! Named, versioned cache partitions.
//!
//! Each partition is one JSON file under the storage root holding a map of
//! cache entries keyed by `METHOD url`. A put always replaces any prior entry
//! for the same key, so concurrent writers for different keys never need
//! coordination beyond the per-partition file lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::http::{Request, Response};

/// The six resource classes a partition can be dedicated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionPurpose {
    Static,
    Dynamic,
    Documents,
    Images,
    Fonts,
    Offline,
}

impl PartitionPurpose {
    pub const ALL: [PartitionPurpose; 6] = [
        PartitionPurpose::Static,
        PartitionPurpose::Dynamic,
        PartitionPurpose::Documents,
        PartitionPurpose::Images,
        PartitionPurpose::Fonts,
        PartitionPurpose::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionPurpose::Static => "static",
            PartitionPurpose::Dynamic => "dynamic",
            PartitionPurpose::Documents => "documents",
            PartitionPurpose::Images => "images",
            PartitionPurpose::Fonts => "fonts",
            PartitionPurpose::Offline => "offline",
        }
    }
}

/// Partition naming scheme: `<app>-<purpose>-v<version>`. Any stored name not
/// matching a current purpose/version is stale and eligible for deletion.
pub fn partition_name(app: &str, purpose: PartitionPurpose, version: u32) -> String {
    format!("{}-{}-v{}", app, purpose.as_str(), version)
}

/// A stored response plus the bookkeeping eviction needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub request_key: String,
    pub response: Response,
    pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry age for the eviction age pass. Prefers the response `date`
    /// header; when that header is absent (common for generated responses)
    /// the recorded insertion time is used so the entry still ages out.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let origin_time = self
            .response
            .header("date")
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(self.inserted_at);
        now - origin_time
    }
}

/// Bounds applied by [`CachePartition::evict`].
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// Partitions at or below this entry count are left alone.
    pub entry_threshold: usize,
    pub max_age: Duration,
    pub size_budget_bytes: usize,
    /// Size-pass batch granularity as a percentage of the entry count.
    pub cleanup_percent: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    pub removed_by_age: usize,
    pub removed_by_size: usize,
}

impl EvictionStats {
    pub fn total(&self) -> usize {
        self.removed_by_age + self.removed_by_size
    }
}

/// One named cache bucket backed by a JSON file.
pub struct CachePartition {
    name: String,
    purpose: PartitionPurpose,
    path: PathBuf,
    /// Serializes the read-modify-write of the partition file.
    lock: Mutex<()>,
}

impl CachePartition {
    pub fn new(root: &Path, app: &str, purpose: PartitionPurpose, version: u32) -> Self {
        let name = partition_name(app, purpose, version);
        let path = root.join(format!("{}.json", name));
        Self {
            name,
            purpose,
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn purpose(&self) -> PartitionPurpose {
        self.purpose
    }

    /// Look up a cached response for this request.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        let _guard = self.lock.lock().await;
        let entries = self.load_entries();
        Ok(entries.get(&request.cache_key()).map(|e| e.response.clone()))
    }

    /// Store a response, replacing any prior entry for the same key.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load_entries();
        let key = request.cache_key();
        entries.insert(
            key.clone(),
            CacheEntry {
                request_key: key,
                response: response.clone(),
                inserted_at: Utc::now(),
            },
        );
        self.save_entries(&entries)
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load_entries();
        let existed = entries.remove(key).is_some();
        if existed {
            self.save_entries(&entries)?;
        }
        Ok(existed)
    }

    pub async fn entry_count(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.load_entries().len())
    }

    /// Total stored body bytes. An estimate: headers and JSON framing are not
    /// counted.
    pub async fn estimated_size(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load_entries()
            .values()
            .map(|e| e.response.body_len())
            .sum())
    }

    /// Delete the backing file entirely.
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete partition {}", self.name))?;
        }
        Ok(())
    }

    /// Age-then-size eviction sweep, run under a single lock hold so the two
    /// passes see a consistent view.
    ///
    /// The age pass removes every entry older than `max_age`. If the
    /// estimated size still exceeds the byte budget, the size pass removes
    /// oldest-inserted entries in batches of `cleanup_percent` of the count
    /// until the size fits. Running the sweep twice with no writes in between
    /// removes nothing the second time.
    pub async fn evict(&self, policy: &EvictionPolicy) -> Result<EvictionStats> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load_entries();
        let mut stats = EvictionStats::default();

        if entries.len() <= policy.entry_threshold {
            return Ok(stats);
        }

        let now = Utc::now();
        entries.retain(|key, entry| {
            if entry.age(now) > policy.max_age {
                debug!(partition = %self.name, key = %key, "Evicting aged entry");
                stats.removed_by_age += 1;
                false
            } else {
                true
            }
        });

        let mut size: usize = entries.values().map(|e| e.response.body_len()).sum();
        if size > policy.size_budget_bytes {
            // Oldest first by insertion order.
            let mut by_age: Vec<(String, DateTime<Utc>, usize)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.inserted_at, e.response.body_len()))
                .collect();
            by_age.sort_by_key(|(_, inserted_at, _)| *inserted_at);

            let batch = (entries.len() * policy.cleanup_percent / 100).max(1);
            let mut victims = by_age.into_iter();
            while size > policy.size_budget_bytes {
                let mut removed_any = false;
                for _ in 0..batch {
                    let Some((key, _, body_len)) = victims.next() else {
                        break;
                    };
                    entries.remove(&key);
                    size = size.saturating_sub(body_len);
                    stats.removed_by_size += 1;
                    removed_any = true;
                }
                if !removed_any {
                    break;
                }
            }
        }

        if stats.total() > 0 {
            self.save_entries(&entries)?;
            debug!(
                partition = %self.name,
                by_age = stats.removed_by_age,
                by_size = stats.removed_by_size,
                "Eviction sweep complete"
            );
        }
        Ok(stats)
    }

    /// Read the partition file. A missing file is an empty partition; a
    /// corrupt file is discarded and treated as empty rather than propagated.
    fn load_entries(&self) -> BTreeMap<String, CacheEntry> {
        if !self.path.exists() {
            return BTreeMap::new();
        }
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(partition = %self.name, error = %e, "Failed to read partition file");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(partition = %self.name, error = %e, "Corrupt partition file, discarding");
                let _ = std::fs::remove_file(&self.path);
                BTreeMap::new()
            }
        }
    }

    fn save_entries(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string(entries)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write partition {}", self.name))?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
