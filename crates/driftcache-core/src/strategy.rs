//! Cache strategy engine.
//!
//! Classifies each intercepted GET request into a partition and applies the
//! read/write policy for that resource class: cache-first for assets that
//! rarely change, network-first where freshness wins, stale-while-revalidate
//! for images. When both cache and network fail the engine resolves to an
//! offline fallback; it never surfaces an error to the request's caller.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::cache::{CacheLifecycle, CachePartition, PartitionPurpose};
use crate::config::EngineConfig;
use crate::http::{Destination, Method, Request, Response};
use crate::net::Network;

/// The read/write policy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

/// Partition and strategy for a resource class. Static assets and fonts are
/// immutable-ish so the cache wins; documents and API traffic want fresh data
/// first; images tolerate staleness while a background fetch refreshes them.
pub fn strategy_for(destination: Destination) -> (PartitionPurpose, StrategyKind) {
    match destination {
        Destination::Script | Destination::Style => {
            (PartitionPurpose::Static, StrategyKind::CacheFirst)
        }
        Destination::Font => (PartitionPurpose::Fonts, StrategyKind::CacheFirst),
        Destination::Image => (PartitionPurpose::Images, StrategyKind::StaleWhileRevalidate),
        Destination::Document => (PartitionPurpose::Documents, StrategyKind::NetworkFirst),
        Destination::Other => (PartitionPurpose::Dynamic, StrategyKind::NetworkFirst),
    }
}

/// What the engine decided for an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The engine produced a response (from cache, network, or fallback).
    Response(Response),
    /// Not ours to handle: non-GET or cross-origin. The caller forwards the
    /// request unmodified (diverting failed mutations to the sync queue).
    PassThrough,
}

pub struct StrategyEngine {
    caches: Arc<CacheLifecycle>,
    network: Arc<dyn Network>,
    config: Arc<EngineConfig>,
}

impl StrategyEngine {
    pub fn new(
        caches: Arc<CacheLifecycle>,
        network: Arc<dyn Network>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            caches,
            network,
            config,
        }
    }

    /// Handle one intercepted request. Never returns an error: every failure
    /// path resolves to a fallback response.
    pub async fn handle(&self, request: &Request) -> FetchOutcome {
        if request.method != Method::Get || !request.is_same_origin(&self.config.origin) {
            return FetchOutcome::PassThrough;
        }

        let destination = request.destination();
        let (purpose, kind) = strategy_for(destination);
        let partition = self.caches.partition(purpose);
        debug!(
            url = %request.url,
            partition = partition.name(),
            strategy = ?kind,
            "Intercepted request"
        );

        let response = match kind {
            StrategyKind::CacheFirst => self.cache_first(partition, request, destination).await,
            StrategyKind::NetworkFirst => self.network_first(partition, request, destination).await,
            StrategyKind::StaleWhileRevalidate => {
                self.stale_while_revalidate(partition, request, destination).await
            }
        };
        FetchOutcome::Response(response)
    }

    /// Cached match wins; otherwise fetch, store on success, and fall back to
    /// offline content if the fetch fails.
    async fn cache_first(
        &self,
        partition: Arc<CachePartition>,
        request: &Request,
        destination: Destination,
    ) -> Response {
        match partition.match_request(request).await {
            Ok(Some(hit)) => return hit,
            Ok(None) => {}
            Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed"),
        }
        match self.fetch_and_store(&partition, request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Cache-first fetch failed");
                self.offline_fallback(request, destination).await
            }
        }
    }

    /// Fetch wins; a failed fetch (rejection or non-success status) falls
    /// back to the cached match, then to offline content.
    async fn network_first(
        &self,
        partition: Arc<CachePartition>,
        request: &Request,
        destination: Destination,
    ) -> Response {
        match self.fetch_and_store(&partition, request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network-first fetch failed, trying cache");
                match partition.match_request(request).await {
                    Ok(Some(hit)) => hit,
                    _ => self.offline_fallback(request, destination).await,
                }
            }
        }
    }

    /// Return the cached hit immediately while a background fetch refreshes
    /// the entry; without a hit, await the fetch. A reader racing the
    /// background update may see the old or new entry, both valid.
    async fn stale_while_revalidate(
        &self,
        partition: Arc<CachePartition>,
        request: &Request,
        destination: Destination,
    ) -> Response {
        let cached = partition.match_request(request).await.ok().flatten();
        if let Some(hit) = cached {
            let network = Arc::clone(&self.network);
            let partition = Arc::clone(&partition);
            let request = request.clone();
            tokio::spawn(async move {
                // Revalidation errors are swallowed; the stale entry stays.
                match network.fetch(&request).await {
                    Ok(response) if response.is_success() => {
                        if let Err(e) = partition.put(&request, &response).await {
                            warn!(url = %request.url, error = %e, "Failed to store revalidated entry");
                        }
                    }
                    Ok(response) => {
                        debug!(url = %request.url, status = response.status, "Revalidation skipped");
                    }
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Revalidation fetch failed");
                    }
                }
            });
            return hit;
        }

        match self.fetch_and_store(&partition, request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Revalidate fetch failed with empty cache");
                self.offline_fallback(request, destination).await
            }
        }
    }

    /// Fetch from the network, requiring a success status. The stored copy is
    /// a clone; the caller still owns the returned body. A rejection or a
    /// non-success status is a failure: a reachable server's 4xx/5xx starts
    /// the caller's fallback chain just like a transport error, so an error
    /// page never shadows a good cached copy.
    async fn fetch_and_store(
        &self,
        partition: &Arc<CachePartition>,
        request: &Request,
    ) -> Result<Response> {
        let response = self.network.fetch(request).await?;
        if !response.is_success() {
            anyhow::bail!("fetch for {} returned status {}", request.url, response.status);
        }
        if let Err(e) = partition.put(request, &response).await {
            warn!(url = %request.url, error = %e, "Failed to cache response");
        }
        Ok(response)
    }

    /// Resolve the canned offline response for a request class: the
    /// pre-cached offline document for navigations and HTML, the pre-cached
    /// offline image for images, a synthesized 503 otherwise.
    async fn offline_fallback(&self, request: &Request, destination: Destination) -> Response {
        let offline = self.caches.partition(PartitionPurpose::Offline);
        let fallback_url = match destination {
            Destination::Document => Some(&self.config.offline_document_url),
            Destination::Image => Some(&self.config.offline_image_url),
            _ => None,
        };
        if let Some(url) = fallback_url {
            match offline.match_request(&Request::get(url.clone())).await {
                Ok(Some(hit)) => return hit,
                Ok(None) => {
                    warn!(url = %url, "Offline fallback missing from offline partition")
                }
                Err(e) => warn!(url = %url, error = %e, "Offline fallback lookup failed"),
            }
        }
        debug!(url = %request.url, "Serving synthesized 503");
        Response::service_unavailable(
            "You appear to be offline and this resource is not available in the cache.",
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
