//! The worker-context service.
//!
//! Owns the cache lifecycle, strategy engine, and a handle to the sync
//! queue, and turns discrete runtime events (install, activate, fetch,
//! message, sync) into engine operations. No handler lets an error escape;
//! failures become fallback responses, logged warnings, or `Error` lifecycle
//! events.

pub mod lifecycle;
pub mod protocol;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLifecycle, ClearCacheOutcome};
use crate::config::EngineConfig;
use crate::http::Request;
use crate::net::Network;
use crate::strategy::{FetchOutcome, StrategyEngine};
use crate::sync::{ReplayReport, SyncQueue};

pub use lifecycle::{LifecycleEvent, LifecycleState, LifecycleTracker, TransitionError};
pub use protocol::{ControlMessage, WorkerReply, SYNC_TAG};

pub struct Worker {
    caches: Arc<CacheLifecycle>,
    engine: StrategyEngine,
    queue: Arc<SyncQueue>,
    lifecycle: Mutex<LifecycleTracker>,
    events: mpsc::Sender<LifecycleEvent>,
}

impl Worker {
    pub fn new(
        root: &Path,
        config: Arc<EngineConfig>,
        network: Arc<dyn Network>,
        queue: Arc<SyncQueue>,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Self {
        let caches = Arc::new(CacheLifecycle::new(
            root,
            Arc::clone(&config),
            Arc::clone(&network),
        ));
        let engine = StrategyEngine::new(Arc::clone(&caches), network, config);
        Self {
            caches,
            engine,
            queue,
            lifecycle: Mutex::new(LifecycleTracker::new()),
            events,
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.lock().await.state()
    }

    pub fn caches(&self) -> Arc<CacheLifecycle> {
        Arc::clone(&self.caches)
    }

    /// Install handler: pre-populate the static and offline partitions. On
    /// failure the worker goes redundant and the error propagates so the
    /// hosting side can retry the registration.
    pub async fn install(&self, update: bool) -> Result<()> {
        self.transition(LifecycleState::Installing).await?;
        if let Err(e) = self.caches.install().await {
            self.emit(LifecycleEvent::Error(format!("install failed: {:#}", e)))
                .await;
            let _ = self.transition(LifecycleState::Redundant).await;
            self.emit(LifecycleEvent::Redundant).await;
            return Err(e);
        }
        self.transition(LifecycleState::Installed).await?;
        self.emit(LifecycleEvent::Installed { update }).await;
        if update {
            // The new version is ready but blocked behind the current worker
            // until the page asks it to take over.
            self.transition(LifecycleState::Waiting).await?;
            self.emit(LifecycleEvent::Waiting).await;
        }
        Ok(())
    }

    /// Activate handler: drop stale partitions and run the eviction sweep.
    pub async fn activate(&self, first: bool) -> Result<()> {
        self.transition(LifecycleState::Activating).await?;
        if let Err(e) = self.caches.activate().await {
            self.emit(LifecycleEvent::Error(format!("activation failed: {:#}", e)))
                .await;
            return Err(e);
        }
        self.transition(LifecycleState::Activated).await?;
        self.emit(LifecycleEvent::Activated { first }).await;
        Ok(())
    }

    /// Take control of open pages.
    pub async fn claim(&self) -> Result<()> {
        self.transition(LifecycleState::Controlling).await?;
        info!("Worker now controlling");
        self.emit(LifecycleEvent::Controlling).await;
        Ok(())
    }

    /// Activate a waiting worker immediately and take control.
    pub async fn skip_waiting(&self) -> Result<()> {
        self.activate(false).await?;
        self.claim().await
    }

    /// Mark this worker superseded by a newer registration. Emits no event:
    /// the replacement worker drives the page from here.
    pub async fn retire(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let _ = lifecycle.transition(LifecycleState::Redundant);
        debug!("Worker retired");
    }

    /// Fetch handler: delegate to the strategy engine.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        self.engine.handle(request).await
    }

    /// Message handler: the worker side of the control protocol.
    pub async fn handle_message(&self, message: ControlMessage) -> Option<WorkerReply> {
        match message {
            ControlMessage::SkipWaiting => {
                if let Err(e) = self.skip_waiting().await {
                    warn!(error = %e, "skip-waiting failed");
                }
                None
            }
            ControlMessage::ClaimClients => {
                if let Err(e) = self.claim().await {
                    warn!(error = %e, "claim failed");
                }
                None
            }
            ControlMessage::UpdateCaches => match self.caches.update_static().await {
                Ok(()) => Some(WorkerReply::CacheUpdated),
                Err(e) => {
                    warn!(error = %e, "Pre-cache refresh failed");
                    None
                }
            },
            ControlMessage::ClearCaches => {
                match self.caches.clear(true).await {
                    ClearCacheOutcome::Unavailable => {
                        warn!("Cache storage unavailable, nothing cleared");
                        return None;
                    }
                    ClearCacheOutcome::Partial { failed } => {
                        warn!(failed, "Some partitions could not be deleted");
                    }
                    ClearCacheOutcome::Cleared => {}
                }
                if let Err(e) = self.caches.update_static().await {
                    warn!(error = %e, "Static repopulation after clear failed");
                }
                Some(WorkerReply::CachesCleared)
            }
        }
    }

    /// Background-sync handler: replay the mutation queue when the tag
    /// matches.
    pub async fn handle_sync(&self, tag: &str) -> ReplayReport {
        if tag != SYNC_TAG {
            debug!(tag, "Ignoring unknown sync tag");
            return ReplayReport::default();
        }
        match self.queue.replay().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Queue replay failed");
                ReplayReport::default()
            }
        }
    }

    async fn transition(&self, next: LifecycleState) -> Result<(), TransitionError> {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.transition(next)?;
        debug!(state = ?next, "Lifecycle transition");
        Ok(())
    }

    /// Deliver a lifecycle event, logging channel errors.
    async fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.events.send(event).await {
            error!(error = %e, "Failed to deliver lifecycle event - channel closed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
