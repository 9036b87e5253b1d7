//! Application configuration management.
//!
//! `EngineConfig` carries the tunable knobs of the caching engine (partition
//! version, pre-cache manifest, eviction thresholds, sync backoff). `Config`
//! wraps it with load/save so the agent persists settings at
//! `~/.config/driftcache/config.json`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths and as the
/// partition name prefix.
pub const APP_NAME: &str = "driftcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Tunable engine parameters. All fields have serde defaults so a partial
/// config file still loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Partition name prefix (`<app>-<purpose>-v<version>`).
    pub app_name: String,

    /// Bumping this invalidates every partition; stale-named ones are deleted
    /// on activation.
    pub cache_version: u32,

    /// Requests outside this origin pass through uncached.
    pub origin: String,

    /// URLs bulk-populated into the static partition at install time.
    pub precache_manifest: Vec<String>,

    /// Offline fallback document, guaranteed present after install.
    pub offline_document_url: String,

    /// Offline fallback image, guaranteed present after install.
    pub offline_image_url: String,

    /// Eviction only runs on partitions holding more entries than this.
    /// 10 keeps the dynamic and documents partitions small without churning
    /// on every activation.
    pub eviction_entry_threshold: usize,

    /// Entries older than this are removed by the age pass.
    pub max_entry_age_minutes: i64,

    /// Byte budget per evictable partition. The size pass removes oldest
    /// entries until the estimated size fits.
    pub size_budget_bytes: usize,

    /// Size-pass batch granularity as a percentage of the entry count.
    pub cleanup_percent: usize,

    /// Delay before re-registering after the worker goes redundant.
    pub reregister_backoff_secs: u64,

    /// Period of the background eviction sweep. Long-lived sessions keep
    /// evicting between activations.
    pub eviction_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            cache_version: 1,
            origin: "http://localhost".to_string(),
            precache_manifest: Vec::new(),
            offline_document_url: "/offline.html".to_string(),
            offline_image_url: "/offline.svg".to_string(),
            eviction_entry_threshold: 10,
            // One week: dynamic API responses and cached documents go stale
            // well before static assets do.
            max_entry_age_minutes: 7 * 24 * 60,
            size_budget_bytes: 4 * 1024 * 1024,
            cleanup_percent: 20,
            reregister_backoff_secs: 5,
            // Half an hour keeps the dynamic partitions bounded without
            // rereading every partition file all day.
            eviction_interval_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Root directory holding partition files and the persisted sync queue.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.eviction_entry_threshold, 10);
        assert_eq!(config.cleanup_percent, 20);
        assert_eq!(config.cache_version, 1);
    }

    #[test]
    fn test_partial_config_parses_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"cache_version": 3, "origin": "https://x.dev"}"#).unwrap();
        assert_eq!(config.cache_version, 3);
        assert_eq!(config.origin, "https://x.dev");
        assert_eq!(config.eviction_entry_threshold, 10);
    }
}
