//! Per-host supervisor.
//!
//! The supervisor owns everything that monitors one engine host:
//! - the monitored set (container ID → metadata)
//! - the stream and processor registries
//! - the worker and event watcher tasks
//! - the shutdown signal and the cleanup protocol
//!
//! ## Lifecycle
//!
//! ```text
//! start(engine) ──► worker(container) × N
//!               └─► event watcher ──► start/stop workers on engine events
//! reload_config ──► stop deselected, push config, start newly selected
//! cleanup       ──► shutdown signal, close streams, join tasks, close engine
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::backoff::{BackoffDecision, BackoffPolicy, ErrorWindow};
use super::registry::{
    ProcessorBinding, ProcessorRegistry, StopSignal, StreamHandle, StreamRegistry,
};
use super::{events, worker};
use crate::config::AppConfig;
use crate::engine::{ContainerInfo, Engine};
use crate::error::MonitorError;
use crate::notifier::{Notification, Notifier};
use crate::processor::ProcessorFactory;

/// Join timeout used when a worker escalates an unreachable host.
pub const UNREACHABLE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Source tag for the agent's own notifications.
pub const AGENT_SOURCE: &str = "logwarden";

struct TrackedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Supervisor for one engine host.
pub struct Supervisor {
    /// Engine address, for logs.
    host: String,

    /// Label added to notifications when several hosts are monitored.
    hostname: Option<String>,

    /// Live engine client; `None` before start and after cleanup.
    engine: RwLock<Option<Arc<dyn Engine>>>,

    /// Current config snapshot.
    config: ArcSwap<AppConfig>,

    /// Monitored containers by ID.
    monitored: Mutex<HashMap<String, ContainerInfo>>,

    streams: StreamRegistry,
    processors: ProcessorRegistry,

    /// Worker and watcher tasks.
    tasks: Mutex<Vec<TrackedTask>>,

    /// Global shutdown signal for this host.
    shutdown: watch::Sender<bool>,

    /// Set while (and after) a cleanup runs; reset by `start`.
    cleaning: AtomicBool,

    /// Set once a cleanup has finished.
    released: AtomicBool,

    /// The last cleanup was caused by the host becoming unreachable.
    unreachable: AtomicBool,

    factory: Arc<dyn ProcessorFactory>,
    notifier: Arc<dyn Notifier>,
    backoff: BackoffPolicy,

    /// Parent span of every task spawned for this host.
    span: Span,
}

impl Supervisor {
    /// Create a supervisor. Nothing runs until [`Supervisor::start`].
    pub fn new(
        config: AppConfig,
        host: impl Into<String>,
        hostname: Option<String>,
        factory: Arc<dyn ProcessorFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (shutdown, _rx) = watch::channel(false);
        let host = host.into();
        let span = tracing::info_span!("host", url = %host, label = ?hostname);

        Self {
            host,
            hostname,
            engine: RwLock::new(None),
            config: ArcSwap::from_pointee(config),
            monitored: Mutex::new(HashMap::new()),
            streams: StreamRegistry::new(),
            processors: ProcessorRegistry::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            cleaning: AtomicBool::new(false),
            released: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            factory,
            notifier,
            backoff: BackoffPolicy::default(),
            span,
        }
    }

    /// Replace the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Start monitoring with `engine`.
    ///
    /// Spawns a worker for every running selected container, then the event
    /// watcher, then sends the start summary.
    pub async fn start(self: &Arc<Self>, engine: Arc<dyn Engine>) -> Result<(), MonitorError> {
        info!(host = %self.host, "Starting monitor");
        let running = engine.list_running().await?;

        self.shutdown.send_replace(false);
        self.cleaning.store(false, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        self.unreachable.store(false, Ordering::SeqCst);
        *self.engine.write().await = Some(engine);

        let config = self.config.load_full();
        for container in running {
            if config.is_selected(&container.name) {
                self.monitor(container).await;
            }
        }

        let watcher = tokio::spawn(events::run(self.clone()).instrument(self.span.clone()));
        self.track("event-watcher".to_string(), watcher).await;

        self.send_start_message().await;
        Ok(())
    }

    /// Apply a config change.
    ///
    /// `None` re-applies the current snapshot (used after a reconnect, when a
    /// reload happened while the host was down). A no-op during shutdown.
    pub async fn reload_config(self: &Arc<Self>, config: Option<AppConfig>) {
        if let Some(config) = config {
            self.config.store(Arc::new(config));
        }

        if self.is_shutdown() {
            debug!(host = %self.host, "Shutdown in progress, skipping reconciliation");
            return;
        }

        if let Err(e) = self.reconcile().await {
            error!(host = %self.host, error = %e, "Config reload failed");
        }
    }

    /// Stop everything and release the engine.
    ///
    /// Each task gets `timeout` to finish; stragglers are aborted. Calls while
    /// a cleanup is already running (or done) return immediately.
    pub async fn cleanup(&self, timeout: Duration) {
        if self.cleaning.swap(true, Ordering::SeqCst) {
            debug!(host = %self.host, "Cleanup already done");
            return;
        }

        info!(host = %self.host, "Starting cleanup");
        self.shutdown.send_replace(true);

        let closed = self.streams.close_all().await;
        for (_, binding) in self.processors.all().await {
            binding.stop.set();
        }
        debug!(host = %self.host, closed, "Closed log streams");

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut abandoned = 0;
        for mut task in tasks {
            match tokio::time::timeout(timeout, &mut task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(task = %task.name, error = %e, "Task ended abnormally");
                }
                Err(_) => {
                    warn!(task = %task.name, ?timeout, "Task did not stop in time, aborting");
                    task.handle.abort();
                    abandoned += 1;
                }
            }
        }

        let engine = self.engine.write().await.take();
        if let Some(engine) = engine {
            engine.close().await;
        }
        self.monitored.lock().await.clear();
        self.released.store(true, Ordering::SeqCst);

        info!(host = %self.host, abandoned, "Cleanup complete");
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    async fn reconcile(self: &Arc<Self>) -> Result<(), MonitorError> {
        let config = self.config.load_full();
        let engine = self
            .engine()
            .await
            .ok_or_else(|| MonitorError::Reconciliation("engine not connected".to_string()))?;

        // Deselected containers: stop the worker, keep the binding.
        let deselected: Vec<ContainerInfo> = {
            let mut monitored = self.monitored.lock().await;
            let ids: Vec<String> = monitored
                .iter()
                .filter(|(_, c)| !config.is_selected(&c.name))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| monitored.remove(id)).collect()
        };
        for container in deselected {
            info!(container = %container.name, "Container no longer selected, stopping monitoring");
            self.close_stream(&container.name).await;
        }

        for (_, binding) in self.processors.all().await {
            binding.processor.load_config(config.clone()).await;
        }

        let running = engine
            .list_running()
            .await
            .map_err(|e| MonitorError::Reconciliation(e.to_string()))?;
        for container in running {
            if !config.is_selected(&container.name) {
                continue;
            }
            let name = container.name.clone();
            if self.monitor(container).await {
                info!(container = %name, "Newly selected container, monitoring started");
            }
        }

        self.send_start_message().await;
        Ok(())
    }

    async fn send_start_message(&self) {
        let config = self.config.load_full();
        let monitored = self.monitored_names().await;
        let not_running: Vec<String> = config
            .selected_containers()
            .into_iter()
            .filter(|name| !monitored.contains(name))
            .collect();

        info!(host = %self.host, monitored = ?monitored, not_running = ?not_running, "Monitoring containers");

        if config.settings.disable_start_message {
            return;
        }

        let body = format!(
            "Monitoring these selected containers:\n - {}\n\nThese selected containers are not running:\n - {}",
            monitored.join("\n - "),
            not_running.join("\n - ")
        );
        self.notify("LogWarden", body);
    }

    // =========================================================================
    // Shared with workers and the event watcher
    // =========================================================================

    /// Add `container` to the monitored set and spawn its worker.
    ///
    /// Skipped when the same container instance (same ID and start time) is
    /// already monitored.
    pub(crate) async fn monitor(self: &Arc<Self>, container: ContainerInfo) -> bool {
        {
            let mut monitored = self.monitored.lock().await;
            if monitored
                .get(&container.id)
                .is_some_and(|known| known.started_at == container.started_at)
            {
                debug!(container = %container.name, "Container already monitored");
                return false;
            }
            monitored.insert(container.id.clone(), container.clone());
        }

        let name = format!("worker:{}", container.name);
        let handle = tokio::spawn(worker::run(self.clone(), container).instrument(self.span.clone()));
        self.track(name, handle).await;
        true
    }

    /// Remove a container from the monitored set. Returns its metadata if it
    /// was monitored.
    pub(crate) async fn forget(&self, id: &str) -> Option<ContainerInfo> {
        self.monitored.lock().await.remove(id)
    }

    /// Remove `container` from the monitored set if the entry is still this
    /// instance (same start time).
    pub(crate) async fn forget_instance(&self, container: &ContainerInfo) -> bool {
        let mut monitored = self.monitored.lock().await;
        let same_instance = monitored
            .get(&container.id)
            .is_some_and(|known| known.started_at == container.started_at);
        if same_instance {
            monitored.remove(&container.id);
        }
        same_instance
    }

    /// Force-close a container's log stream and set its stop signal.
    pub(crate) async fn close_stream(&self, name: &str) {
        self.streams.close(name).await;
        self.processors.stop(name).await;
    }

    pub(crate) async fn register_stream(&self, name: &str) -> StreamHandle {
        self.streams.register(name).await
    }

    pub(crate) async fn deregister_stream(&self, name: &str, handle: &StreamHandle) {
        self.streams.deregister(name, handle).await;
    }

    /// Existing binding for `name`, or a fresh one from the factory.
    pub(crate) async fn binding_for(&self, name: &str) -> (ProcessorBinding, bool) {
        if let Some(binding) = self.processors.get(name).await {
            return (binding, true);
        }

        let stop = StopSignal::new();
        let processor = self.factory.create(name, self.config.load_full(), stop.clone());
        let slot = self
            .processors
            .create_binding(name, ProcessorBinding::new(processor, stop))
            .await;
        let reused = !slot.was_created();
        (slot.into_binding(), reused)
    }

    pub(crate) async fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.engine.read().await.clone()
    }

    pub(crate) fn config(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Fire-and-forget notification from the agent itself.
    pub(crate) fn notify(&self, title: &str, body: String) {
        let notification = Notification {
            source: AGENT_SOURCE.to_string(),
            title: title.to_string(),
            body,
            keywords: Vec::new(),
            hostname: self.hostname.clone(),
        };
        let notifier = self.notifier.clone();
        let config = self.config.load_full();
        tokio::spawn(async move {
            notifier.notify(&config, notification).await;
        });
    }

    /// Count an error against `errors` and wait out the backoff.
    ///
    /// Returns true when the caller has to stop its loop: retries are
    /// exhausted or shutdown began while waiting. On exhaustion the engine is
    /// pinged, and an unreachable host gets a detached full cleanup.
    pub(crate) async fn handle_error(
        self: &Arc<Self>,
        errors: &mut ErrorWindow,
        source: &str,
        err: &MonitorError,
    ) -> bool {
        match self.backoff.evaluate(errors, Instant::now()) {
            BackoffDecision::Retry(delay) => {
                if errors.count == 1 {
                    error!(source = %source, error = %err, "Stream failed");
                } else {
                    warn!(source = %source, error = %err, count = errors.count, "Stream failed again");
                }
                debug!(source = %source, ?delay, "Backing off before reconnect");
                self.sleep_unless_shutdown(delay).await
            }
            BackoffDecision::GiveUp => {
                let exhausted = MonitorError::ExhaustedRetries(source.to_string());
                error!(error = %exhausted, count = errors.count, "Giving up");

                if !self.engine_reachable().await && !self.is_shutdown() {
                    let unreachable = MonitorError::HostUnreachable(self.host.clone());
                    error!(error = %unreachable, "Lost connection to engine host");
                    self.trigger_unreachable_cleanup();
                }
                true
            }
        }
    }

    /// Sleep for `delay`; returns true if shutdown interrupted the sleep.
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_shutdown(),
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    async fn engine_reachable(&self) -> bool {
        let Some(engine) = self.engine().await else {
            return false;
        };
        match engine.ping().await {
            Ok(reachable) => reachable,
            Err(e) => {
                error!(host = %self.host, error = %e, "Ping failed");
                false
            }
        }
    }

    /// Run a full cleanup without joining the caller.
    fn trigger_unreachable_cleanup(self: &Arc<Self>) {
        if self.cleaning.load(Ordering::SeqCst) {
            return;
        }
        self.unreachable.store(true, Ordering::SeqCst);

        let supervisor = self.clone();
        tokio::spawn(
            async move {
                supervisor.cleanup(UNREACHABLE_CLEANUP_TIMEOUT).await;
            }
            .instrument(self.span.clone()),
        );
    }

    async fn track(&self, name: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TrackedTask { name, handle });
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Whether the shutdown signal is set.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Whether the host was lost and its cleanup has finished, so a new
    /// engine connection may be started.
    pub fn needs_reconnect(&self) -> bool {
        self.unreachable.load(Ordering::SeqCst) && self.released.load(Ordering::SeqCst)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub async fn is_monitored(&self, id: &str) -> bool {
        self.monitored.lock().await.contains_key(id)
    }

    /// Names of monitored containers, sorted.
    pub async fn monitored_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .monitored
            .lock()
            .await
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn has_stream(&self, name: &str) -> bool {
        self.streams.contains(name).await
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.len().await
    }

    pub async fn binding(&self, name: &str) -> Option<ProcessorBinding> {
        self.processors.get(name).await
    }

    /// Live worker tasks for a container name.
    pub async fn running_workers(&self, name: &str) -> usize {
        let task_name = format!("worker:{name}");
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.name == task_name && !t.handle.is_finished())
            .count()
    }

    /// Live tasks of any kind.
    pub async fn running_tasks(&self) -> usize {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::processor::KeywordProcessorFactory;
    use async_trait::async_trait;

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn notify(&self, _config: &AppConfig, _notification: Notification) {}
    }

    fn supervisor() -> Arc<Supervisor> {
        let config = AppConfig::from_text(
            "containers:\n  web:\n    keywords: [error]\nsettings:\n  disable_start_message: true\n",
            config::FileFormat::Yaml,
        )
        .unwrap();
        let notifier: Arc<dyn Notifier> = Arc::new(SilentNotifier);
        let factory = Arc::new(KeywordProcessorFactory::new(notifier.clone(), None));
        Arc::new(Supervisor::new(config, "mock://local", None, factory, notifier))
    }

    #[tokio::test]
    async fn test_cleanup_releases_engine_slot_before_close_finishes() {
        let engine = Arc::new(MockEngine::new());
        engine.add_container("c1", "web").await;
        engine.set_close_delay(Duration::from_millis(500)).await;

        let supervisor = supervisor();
        supervisor.start(engine.clone()).await.unwrap();

        let cleanup = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.cleanup(Duration::from_secs(1)).await })
        };

        // Readers of the engine slot must not wait for the slow close.
        let released = tokio::time::timeout(Duration::from_millis(300), async {
            while supervisor.engine().await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(released.is_ok());
        assert!(!engine.is_closed().await);

        cleanup.await.unwrap();
        assert!(engine.is_closed().await);
    }

    #[tokio::test]
    async fn test_forget_instance_ignores_newer_start() {
        let supervisor = supervisor();
        let engine = MockEngine::new();
        let old = engine.add_container("c1", "web").await;
        engine.restart_container("c1").await;
        let new = engine.get_container("c1").await.unwrap();

        supervisor.monitored.lock().await.insert(new.id.clone(), new.clone());

        assert!(!supervisor.forget_instance(&old).await);
        assert!(supervisor.is_monitored("c1").await);

        assert!(supervisor.forget_instance(&new).await);
        assert!(!supervisor.is_monitored("c1").await);
    }
}
