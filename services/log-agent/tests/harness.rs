//! Test harness for log agent integration tests.
//!
//! Provides recording processors and notifiers, a supervisor wired to a
//! [`MockEngine`], and a polling helper for asserting on async state.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use logwarden_agent::config::AppConfig;
use logwarden_agent::monitor::{BackoffPolicy, Jitter, StopSignal};
use logwarden_agent::notifier::{Notification, Notifier};
use logwarden_agent::processor::{LineProcessor, ProcessorFactory};
use logwarden_agent::{MockEngine, Supervisor};

/// Poll `$cond` every 10ms for up to 5s; evaluates to whether it became true.
#[macro_export]
macro_rules! wait_until {
    ($cond:expr) => {{
        let mut reached = false;
        for _ in 0..500 {
            if $cond {
                reached = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        reached
    }};
}

pub const TWO_CONTAINERS: &str = r#"
containers:
  web:
    keywords: [error]
  db:
    keywords: [deadlock]
settings:
  disable_start_message: true
  disable_container_event_message: true
"#;

pub const WEB_ONLY: &str = r#"
containers:
  web:
    keywords: [error]
settings:
  disable_start_message: true
  disable_container_event_message: true
"#;

pub fn app_config(yaml: &str) -> AppConfig {
    AppConfig::from_text(yaml, config::FileFormat::Yaml).unwrap()
}

/// Backoff with millisecond delays so retry paths finish quickly.
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        unit: Duration::from_millis(1),
        jitter: Jitter::fixed(1.0),
        ..BackoffPolicy::default()
    }
}

// =============================================================================
// Recording processor
// =============================================================================

#[derive(Default)]
pub struct RecordingProcessor {
    lines: Mutex<Vec<String>>,
    resumes: AtomicUsize,
    reloads: AtomicUsize,
}

impl RecordingProcessor {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LineProcessor for RecordingProcessor {
    async fn process_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    async fn load_config(&self, _config: Arc<AppConfig>) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }

    async fn resume_flush_timer(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    created: Mutex<HashMap<String, Arc<RecordingProcessor>>>,
    creations: AtomicUsize,
}

impl RecordingFactory {
    pub fn processor(&self, container: &str) -> Option<Arc<RecordingProcessor>> {
        self.created.lock().unwrap().get(container).cloned()
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }
}

impl ProcessorFactory for RecordingFactory {
    fn create(
        &self,
        container: &str,
        _config: Arc<AppConfig>,
        _stop: StopSignal,
    ) -> Arc<dyn LineProcessor> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        let processor = Arc::new(RecordingProcessor::default());
        self.created
            .lock()
            .unwrap()
            .insert(container.to_string(), Arc::clone(&processor));
        processor
    }
}

// =============================================================================
// Hanging processor
// =============================================================================

/// Counts processor calls that are in progress. The count drops when the
/// call's future is dropped, which is how an aborted worker shows up.
#[derive(Default)]
pub struct HangingFactory {
    entered: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl HangingFactory {
    /// Calls that have started.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Calls still pending.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl ProcessorFactory for HangingFactory {
    fn create(
        &self,
        _container: &str,
        _config: Arc<AppConfig>,
        _stop: StopSignal,
    ) -> Arc<dyn LineProcessor> {
        Arc::new(HangingProcessor {
            entered: Arc::clone(&self.entered),
            active: Arc::clone(&self.active),
        })
    }
}

/// Never returns from `process_line`, ignoring every signal.
pub struct HangingProcessor {
    entered: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

struct ActiveCall(Arc<AtomicUsize>);

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LineProcessor for HangingProcessor {
    async fn process_line(&self, _line: &str) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let _call = ActiveCall(Arc::clone(&self.active));
        self.entered.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }

    async fn load_config(&self, _config: Arc<AppConfig>) {}

    async fn resume_flush_timer(&self) {}
}

// =============================================================================
// Recording notifier
// =============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.body).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _config: &AppConfig, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub struct Fixture {
    pub engine: Arc<MockEngine>,
    pub supervisor: Arc<Supervisor>,
    pub factory: Arc<RecordingFactory>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    /// Supervisor for `yaml` on an empty mock engine. Not started.
    pub fn new(yaml: &str) -> Self {
        let engine = Arc::new(MockEngine::new());
        let factory = Arc::new(RecordingFactory::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = Arc::new(
            Supervisor::new(
                app_config(yaml),
                "mock://local",
                None,
                factory.clone(),
                notifier.clone(),
            )
            .with_backoff(fast_backoff()),
        );

        Self {
            engine,
            supervisor,
            factory,
            notifier,
        }
    }

    /// Supervisor for `yaml` whose processors come from `factory`. Not
    /// started.
    pub fn with_factory(yaml: &str, factory: Arc<dyn ProcessorFactory>) -> (Arc<MockEngine>, Arc<Supervisor>) {
        let engine = Arc::new(MockEngine::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = Arc::new(
            Supervisor::new(app_config(yaml), "mock://local", None, factory, notifier)
                .with_backoff(fast_backoff()),
        );
        (engine, supervisor)
    }

    pub async fn start(&self) {
        self.supervisor.start(self.engine.clone()).await.unwrap();
    }

    /// Wait until the container's worker has an open log stream.
    pub async fn streaming(&self, id: &str) -> bool {
        wait_until!(self.engine.log_subscribers(id).await == 1)
    }

    /// Wait until the event watcher is subscribed.
    pub async fn watching_events(&self) -> bool {
        wait_until!(self.engine.event_subscribers().await == 1)
    }
}
