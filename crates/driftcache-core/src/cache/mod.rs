//! Cache partitions and their lifecycle.
//!
//! A partition is a named, versioned bucket dedicated to one resource class
//! (static assets, dynamic responses, documents, images, fonts, offline
//! fallbacks). `CacheLifecycle` pre-populates partitions at install time,
//! removes stale-named ones on activation, and evicts aging or excess entries
//! from the accumulating partitions.

pub mod lifecycle;
pub mod partition;

pub use lifecycle::{CacheLifecycle, ClearCacheOutcome};
pub use partition::{CacheEntry, CachePartition, EvictionPolicy, PartitionPurpose};
