//! Page-side coordinator.
//!
//! One constructible service object owning the whole engine: it registers the
//! worker, listens for its lifecycle events, watches connectivity, surfaces
//! notifications, and diverts offline mutations to the sync queue. Collaborators
//! (network, notifier, page reload) are injected at construction; capabilities
//! are declared up front instead of sniffed from the environment.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ClearCacheOutcome;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::http::{Method, Request};
use crate::net::{Network, NetworkStatus};
use crate::notify::{Notification, Notifier, PageReload, Severity};
use crate::strategy::FetchOutcome;
use crate::sync::{QueuedMutation, SyncQueue};
use crate::worker::{ControlMessage, LifecycleEvent, LifecycleState, Worker, SYNC_TAG};

/// Auto-dismiss delay for transient banners. Actionable banners (update
/// available) stay until acted on.
const BANNER_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle events queue a few deep during an install burst; 32 gives the
/// listener plenty of slack.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// What the hosting environment supports. Declared by the embedder rather
/// than probed from globals, so tests and headless hosts can opt out.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub service_workers: bool,
    pub background_sync: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            service_workers: true,
            background_sync: true,
        }
    }
}

pub struct Coordinator {
    root: PathBuf,
    config: Arc<EngineConfig>,
    network: Arc<dyn Network>,
    notifier: Arc<dyn Notifier>,
    reload: Arc<dyn PageReload>,
    capabilities: Capabilities,
    queue: Arc<SyncQueue>,
    worker: RwLock<Option<Arc<Worker>>>,

    events_tx: mpsc::Sender<LifecycleEvent>,
    /// Taken by the event listener on first start.
    events_rx: Mutex<Option<mpsc::Receiver<LifecycleEvent>>>,
    status_tx: watch::Sender<NetworkStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Set once the periodic eviction sweep is running.
    eviction_timer_started: AtomicBool,
    registered: AtomicBool,
    /// How many registrations have completed; any beyond the first is an
    /// update install.
    registration_count: AtomicUsize,
    installed: AtomicBool,
    update_available: AtomicBool,
    /// Guards the post-update reload so a controlling worker triggers it at
    /// most once.
    reload_requested: AtomicBool,
}

impl Coordinator {
    pub fn new(
        root: &Path,
        config: Arc<EngineConfig>,
        network: Arc<dyn Network>,
        notifier: Arc<dyn Notifier>,
        reload: Arc<dyn PageReload>,
        capabilities: Capabilities,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(NetworkStatus::Online);
        let queue = Arc::new(SyncQueue::new(root, Arc::clone(&network)));
        Arc::new(Self {
            root: root.to_path_buf(),
            config,
            network,
            notifier,
            reload,
            capabilities,
            queue,
            worker: RwLock::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            status_tx,
            tasks: Mutex::new(Vec::new()),
            eviction_timer_started: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            registration_count: AtomicUsize::new(0),
            installed: AtomicBool::new(false),
            update_available: AtomicBool::new(false),
            reload_requested: AtomicBool::new(false),
        })
    }

    /// Start the engine: spawn the event and connectivity listeners, restore
    /// the persisted queue, and register the worker. Fails fast when the
    /// environment lacks worker support or when the registration itself
    /// fails; the hosting side may call again to retry.
    pub async fn register(self: &Arc<Self>) -> Result<()> {
        if !self.capabilities.service_workers {
            return Err(EngineError::Unsupported.into());
        }

        self.start_event_listener().await;
        self.start_network_monitor().await;
        self.start_eviction_timer().await;

        let pending = self.queue.len().await;
        if pending > 0 {
            info!(pending, "Restored queued mutations from storage");
        }

        self.perform_registration().await.map_err(|e| {
            error!(error = %e, "Worker registration failed");
            e
        })
    }

    /// Build and install a worker, superseding any current one. The worker is
    /// published before installation starts so lifecycle events can always
    /// find it.
    async fn perform_registration(self: &Arc<Self>) -> Result<()> {
        let update = self.registration_count.load(Ordering::SeqCst) > 0;
        let worker = Arc::new(Worker::new(
            &self.root,
            Arc::clone(&self.config),
            Arc::clone(&self.network),
            Arc::clone(&self.queue),
            self.events_tx.clone(),
        ));

        let previous = {
            let mut slot = self.worker.write().await;
            slot.replace(Arc::clone(&worker))
        };
        if let Some(previous) = previous {
            previous.retire().await;
        }

        worker.install(update).await?;
        if !update {
            worker.activate(true).await?;
        }

        self.registered.store(true, Ordering::SeqCst);
        self.registration_count.fetch_add(1, Ordering::SeqCst);
        // Freshly registered workers refresh the pre-cache so returning
        // visitors pick up changed static assets.
        let _ = worker.handle_message(ControlMessage::UpdateCaches).await;
        info!(update, "Worker registered");
        Ok(())
    }

    async fn start_event_listener(self: &Arc<Self>) {
        let Some(mut rx) = self.events_rx.lock().await.take() else {
            return; // already running
        };
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                coordinator.handle_event(event).await;
            }
            debug!("Lifecycle event channel closed");
        });
        self.tasks.lock().await.push(handle);
    }

    async fn handle_event(self: &Arc<Self>, event: LifecycleEvent) {
        debug!(?event, "Lifecycle event");
        match event {
            LifecycleEvent::Installed { update } => {
                self.installed.store(true, Ordering::SeqCst);
                if !update {
                    self.notify(
                        "App is ready to work offline.",
                        Severity::Info,
                        Some(BANNER_TIMEOUT),
                    );
                }
            }
            LifecycleEvent::Waiting => {
                self.update_available.store(true, Ordering::SeqCst);
                // Stays on screen until the user applies the update.
                self.notify("A new version is available. Update now?", Severity::Info, None);
            }
            LifecycleEvent::Activated { first } => {
                if first {
                    // Control open pages immediately on the very first
                    // activation instead of waiting for the next navigation.
                    let worker = self.worker.read().await.as_ref().map(Arc::clone);
                    if let Some(worker) = worker {
                        worker.handle_message(ControlMessage::ClaimClients).await;
                    }
                }
            }
            LifecycleEvent::Controlling => {
                if self.update_available.load(Ordering::SeqCst)
                    && !self.reload_requested.swap(true, Ordering::SeqCst)
                {
                    info!("Updated worker took control, reloading page");
                    self.reload.reload();
                }
            }
            LifecycleEvent::Redundant => {
                self.registered.store(false, Ordering::SeqCst);
                warn!("Worker went redundant, scheduling re-registration");
                let coordinator = Arc::clone(self);
                let backoff = Duration::from_secs(self.config.reregister_backoff_secs);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    if let Err(e) = coordinator.perform_registration().await {
                        error!(error = %e, "Re-registration failed");
                    }
                });
                self.tasks.lock().await.push(handle);
            }
            LifecycleEvent::Error(message) => {
                error!(%message, "Worker reported an error");
            }
        }
    }

    async fn start_network_monitor(self: &Arc<Self>) {
        let mut rx = self.status_tx.subscribe();
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                coordinator.handle_connectivity(status).await;
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Run the eviction sweep on a fixed period so long-lived sessions keep
    /// aging entries out between activations. The immediate first tick is
    /// skipped; activation already swept.
    async fn start_eviction_timer(self: &Arc<Self>) {
        if self.eviction_timer_started.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        let coordinator = Arc::clone(self);
        let period = Duration::from_secs(self.config.eviction_interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let worker = coordinator.worker.read().await.as_ref().map(Arc::clone);
                if let Some(worker) = worker {
                    debug!("Periodic eviction sweep");
                    worker.caches().evict_all().await;
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn handle_connectivity(&self, status: NetworkStatus) {
        match status {
            NetworkStatus::Online => {
                info!("Connectivity restored");
                let report = self.replay_queue().await;
                if report.succeeded > 0 {
                    self.notify(
                        format!("Synced {} offline change(s).", report.succeeded),
                        Severity::Success,
                        Some(BANNER_TIMEOUT),
                    );
                }
            }
            NetworkStatus::Offline => {
                warn!("Device went offline");
                self.notify(
                    "You are offline. Changes will sync when you reconnect.",
                    Severity::Warning,
                    Some(BANNER_TIMEOUT),
                );
            }
        }
    }

    /// Replay the sync queue, through the worker's sync handler when
    /// background sync is available, directly otherwise.
    async fn replay_queue(&self) -> crate::sync::ReplayReport {
        let worker = self.worker.read().await.as_ref().map(Arc::clone);
        match worker {
            Some(worker) if self.capabilities.background_sync => {
                worker.handle_sync(SYNC_TAG).await
            }
            _ => match self.queue.replay().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Queue replay failed");
                    crate::sync::ReplayReport::default()
                }
            },
        }
    }

    /// Report a connectivity transition. Duplicate reports of the current
    /// status are ignored.
    pub fn set_network_status(&self, status: NetworkStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn is_offline(&self) -> bool {
        *self.status_tx.borrow() == NetworkStatus::Offline
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    pub fn update_available(&self) -> bool {
        self.update_available.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> Arc<SyncQueue> {
        Arc::clone(&self.queue)
    }

    pub async fn worker_state(&self) -> Option<LifecycleState> {
        let worker = self.worker.read().await.as_ref().map(Arc::clone);
        match worker {
            Some(worker) => Some(worker.state().await),
            None => None,
        }
    }

    /// Route an intercepted request through the worker's strategy engine.
    /// Without a registered worker everything passes through. A mutating
    /// request passed through while offline is captured in the sync queue;
    /// the caller's own send attempt cannot succeed, so the queued copy is
    /// what eventually reaches the server.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        let worker = self.worker.read().await.as_ref().map(Arc::clone);
        let outcome = match worker {
            Some(worker) => worker.handle_fetch(request).await,
            None => FetchOutcome::PassThrough,
        };
        if matches!(outcome, FetchOutcome::PassThrough)
            && request.method.is_mutating()
            && self.is_offline()
        {
            let body = request
                .body
                .as_deref()
                .and_then(|raw| serde_json::from_slice(raw).ok())
                .unwrap_or(Value::Null);
            if let Err(e) = self
                .queue_form_submission(request.url.clone(), request.method, body)
                .await
            {
                warn!(url = %request.url, error = %e, "Failed to queue offline mutation");
            }
        }
        outcome
    }

    /// Capture a mutating submission. Online, a direct send is attempted and
    /// the entry only stays queued if it fails; offline, the entry is
    /// persisted untried and the user is told their change is saved.
    pub async fn queue_form_submission(
        &self,
        url: impl Into<String>,
        method: Method,
        body: Value,
    ) -> Result<QueuedMutation> {
        let online = !self.is_offline();
        let mutation = self.queue.enqueue(url, method, body, online).await?;
        if !online {
            self.notify(
                "Your change has been saved and will be submitted when you reconnect.",
                Severity::Info,
                Some(BANNER_TIMEOUT),
            );
        }
        Ok(mutation)
    }

    /// Apply a pending update: ask the waiting worker to activate and take
    /// control. The page reload follows from the controlling event.
    pub async fn apply_update(&self) -> Result<()> {
        let worker = self.worker.read().await.as_ref().map(Arc::clone);
        let worker = worker.ok_or(EngineError::NotRegistered)?;
        worker.handle_message(ControlMessage::SkipWaiting).await;
        Ok(())
    }

    /// Delete every named partition, reporting partial failure distinctly
    /// from storage being unavailable. For the softer wipe that keeps the
    /// offline fallbacks, send [`ControlMessage::ClearCaches`] instead.
    pub async fn clear_cache(&self) -> ClearCacheOutcome {
        let worker = self.worker.read().await.as_ref().map(Arc::clone);
        let Some(worker) = worker else {
            return ClearCacheOutcome::Unavailable;
        };
        let outcome = worker.caches().clear(false).await;
        match outcome {
            ClearCacheOutcome::Cleared => {
                self.notify("Cached content cleared.", Severity::Success, Some(BANNER_TIMEOUT));
            }
            ClearCacheOutcome::Partial { failed } => {
                warn!(failed, "Some partitions could not be deleted");
            }
            ClearCacheOutcome::Unavailable => {
                warn!("Cache storage unavailable, nothing cleared");
            }
        }
        outcome
    }

    /// Stop background listeners. The persisted queue and partitions remain
    /// on disk for the next start.
    pub async fn stop(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("Coordinator stopped");
    }

    fn notify(&self, message: impl Into<String>, severity: Severity, timeout: Option<Duration>) {
        let mut notification = Notification::new(message, severity);
        if let Some(timeout) = timeout {
            notification = notification.with_timeout(timeout);
        }
        self.notifier.notify(notification);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::testutil::{CountingReload, MockNetwork, RecordingNotifier};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        network: Arc<MockNetwork>,
        notifier: Arc<RecordingNotifier>,
        reload: Arc<CountingReload>,
        coordinator: Arc<Coordinator>,
    }

    fn fixture_with(capabilities: Capabilities) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(EngineConfig {
            precache_manifest: vec!["/".to_string(), "/index.html".to_string()],
            reregister_backoff_secs: 0,
            ..EngineConfig::default()
        });
        let network = Arc::new(MockNetwork::new());
        for url in ["/", "/index.html", "/offline.html", "/offline.svg"] {
            network.route(url, Response::with_body(200, url.as_bytes().to_vec()));
        }
        let notifier = Arc::new(RecordingNotifier::new());
        let reload = Arc::new(CountingReload::new());
        let coordinator = Coordinator::new(
            dir.path(),
            config,
            Arc::clone(&network) as Arc<dyn Network>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&reload) as Arc<dyn PageReload>,
            capabilities,
        );
        Fixture {
            _dir: dir,
            network,
            notifier,
            reload,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Capabilities::default())
    }

    /// Let spawned listener tasks drain their channels.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_register_installs_and_takes_control() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;

        assert!(fx.coordinator.is_registered());
        assert!(fx.coordinator.is_installed());
        assert_eq!(
            fx.coordinator.worker_state().await,
            Some(LifecycleState::Controlling)
        );
        assert_eq!(fx.notifier.messages_containing("ready to work offline"), 1);
        // First install never reloads the page.
        assert_eq!(fx.reload.count(), 0);

        // Both manifest entries landed in the static partition.
        let worker = fx.coordinator.worker.read().await.as_ref().map(Arc::clone).unwrap();
        let statics = worker.caches().partition(crate::cache::PartitionPurpose::Static);
        for url in ["/", "/index.html"] {
            assert!(statics.match_request(&Request::get(url)).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_unsupported_environment_fails_registration() {
        let fx = fixture_with(Capabilities {
            service_workers: false,
            background_sync: false,
        });
        let err = fx.coordinator.register().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Unsupported)
        ));
        assert!(!fx.coordinator.is_registered());
    }

    #[tokio::test]
    async fn test_offline_submission_queues_and_syncs_on_reconnect() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;

        fx.network.set_offline(true);
        fx.coordinator.set_network_status(NetworkStatus::Offline);
        settle().await;
        assert_eq!(fx.notifier.messages_containing("You are offline"), 1);

        let before = fx.network.requests_for("/api/notes");
        fx.coordinator
            .queue_form_submission("/api/notes", Method::Post, json!({"text": "hi"}))
            .await
            .unwrap();
        // Persisted without a send attempt, and the user was told.
        assert_eq!(fx.network.requests_for("/api/notes"), before);
        assert_eq!(fx.coordinator.queue().len().await, 1);
        assert_eq!(fx.notifier.messages_containing("saved"), 1);

        fx.network.set_offline(false);
        fx.network.route("/api/notes", Response::new(201));
        fx.coordinator.set_network_status(NetworkStatus::Online);
        settle().await;

        assert!(fx.coordinator.queue().is_empty().await);
        assert_eq!(fx.network.requests_for("/api/notes"), before + 1);
        assert_eq!(fx.notifier.messages_containing("Synced 1"), 1);
    }

    #[tokio::test]
    async fn test_update_flow_reloads_exactly_once() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;

        // A second registration is an update install: the new worker waits.
        fx.coordinator.register().await.unwrap();
        settle().await;
        assert!(fx.coordinator.update_available());
        assert_eq!(fx.notifier.messages_containing("new version"), 1);
        assert_eq!(
            fx.coordinator.worker_state().await,
            Some(LifecycleState::Waiting)
        );
        assert_eq!(fx.reload.count(), 0);

        fx.coordinator.apply_update().await.unwrap();
        settle().await;
        assert_eq!(
            fx.coordinator.worker_state().await,
            Some(LifecycleState::Controlling)
        );
        assert_eq!(fx.reload.count(), 1);

        // A repeated apply is a no-op: the worker already controls the page.
        fx.coordinator.apply_update().await.unwrap();
        settle().await;
        assert_eq!(fx.reload.count(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_retries_after_backoff() {
        let fx = fixture();
        fx.network.unroute("/index.html");
        assert!(fx.coordinator.register().await.is_err());
        assert!(!fx.coordinator.is_registered());

        // Once the asset is reachable the scheduled retry succeeds.
        fx.network.route("/index.html", Response::new(200));
        settle().await;
        assert!(fx.coordinator.is_registered());
    }

    #[tokio::test]
    async fn test_clear_cache_without_worker_is_unavailable() {
        let fx = fixture();
        assert_eq!(fx.coordinator.clear_cache().await, ClearCacheOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_clear_cache_deletes_every_partition() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;

        assert_eq!(fx.coordinator.clear_cache().await, ClearCacheOutcome::Cleared);
        assert_eq!(fx.notifier.messages_containing("cleared"), 1);

        let worker = fx.coordinator.worker.read().await.as_ref().map(Arc::clone).unwrap();
        for purpose in crate::cache::PartitionPurpose::ALL {
            let partition = worker.caches().partition(purpose);
            assert_eq!(partition.entry_count().await.unwrap(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_evicts_without_reactivation() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;

        // 15 entries stamped well past the max age, written after activation
        // so only the timer can remove them.
        let worker = fx.coordinator.worker.read().await.as_ref().map(Arc::clone).unwrap();
        let dynamic = worker.caches().partition(crate::cache::PartitionPurpose::Dynamic);
        let old_date = (chrono::Utc::now() - chrono::Duration::days(8)).to_rfc2822();
        for i in 0..15 {
            let resp = Response::new(200).with_header("date", old_date.clone());
            dynamic
                .put(&Request::get(format!("/api/{}", i)), &resp)
                .await
                .unwrap();
        }
        assert_eq!(dynamic.entry_count().await.unwrap(), 15);

        tokio::time::sleep(Duration::from_secs(
            fx.coordinator.config.eviction_interval_secs + 1,
        ))
        .await;
        assert_eq!(dynamic.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mutating_requests_pass_through() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;
        let request = Request::new(Method::Post, "/api/notes");
        assert!(matches!(
            fx.coordinator.handle_fetch(&request).await,
            FetchOutcome::PassThrough
        ));
    }

    #[tokio::test]
    async fn test_offline_mutating_fetch_is_diverted_to_queue() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;

        fx.coordinator.set_network_status(NetworkStatus::Offline);
        settle().await;

        let request =
            Request::new(Method::Post, "/api/notes").with_body(br#"{"text":"hi"}"#.to_vec());
        assert!(matches!(
            fx.coordinator.handle_fetch(&request).await,
            FetchOutcome::PassThrough
        ));

        let entries = fx.coordinator.queue().entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "/api/notes");
        assert_eq!(entries[0].body, json!({"text": "hi"}));
        assert_eq!(fx.notifier.messages_containing("saved"), 1);
    }

    #[tokio::test]
    async fn test_stop_halts_listeners() {
        let fx = fixture();
        fx.coordinator.register().await.unwrap();
        settle().await;
        fx.coordinator.stop().await;

        let before = fx.notifier.notifications().len();
        fx.coordinator.set_network_status(NetworkStatus::Offline);
        settle().await;
        assert_eq!(fx.notifier.notifications().len(), before);
    }
}
