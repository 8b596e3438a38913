//! Registries shared between the supervisor, the event watcher and workers.
//!
//! - [`StreamRegistry`]: container name → the open log stream's [`StreamHandle`].
//!   Closing a handle wakes the worker blocked on that stream.
//! - [`ProcessorRegistry`]: container name → [`ProcessorBinding`], the line
//!   processor and stop signal that outlive individual workers.
//!
//! Each map sits behind its own lock and no lock is held across an engine call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use crate::processor::LineProcessor;

// =============================================================================
// Signals
// =============================================================================

/// Level-triggered stop flag for one container.
///
/// Setting it is idempotent; clearing it re-arms the binding for a new worker.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver observing every change of the flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on set.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handle for one open log stream.
///
/// The worker reading the stream races [`StreamHandle::closed`] against the
/// next chunk, so `close()` from any task unblocks the read.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    generation: u64,
    closed: Arc<watch::Sender<bool>>,
}

impl StreamHandle {
    fn new(generation: u64) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            generation,
            closed: Arc::new(tx),
        }
    }

    /// Registration sequence number, unique per registry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the handle is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

// =============================================================================
// Stream Registry
// =============================================================================

/// Open log streams by container name.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    handles: RwLock<HashMap<String, StreamHandle>>,
    next_generation: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh handle for `name`.
    ///
    /// A handle already registered under the name is closed, so at most one
    /// live handle exists per container.
    pub async fn register(&self, name: &str) -> StreamHandle {
        let handle = StreamHandle::new(self.next_generation.fetch_add(1, Ordering::Relaxed));
        let previous = self
            .handles
            .write()
            .await
            .insert(name.to_string(), handle.clone());

        if let Some(previous) = previous {
            previous.close();
        }
        handle
    }

    /// Remove `handle` if it is still the one registered for `name`, and close it.
    pub async fn deregister(&self, name: &str, handle: &StreamHandle) {
        {
            let mut handles = self.handles.write().await;
            if handles
                .get(name)
                .is_some_and(|h| h.generation == handle.generation)
            {
                handles.remove(name);
            }
        }
        handle.close();
    }

    /// Close and remove the handle for `name`. Returns whether one existed.
    pub async fn close(&self, name: &str) -> bool {
        let removed = self.handles.write().await.remove(name);
        match removed {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Close and remove every handle. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.handles.write().await.drain().collect();
        for (_, handle) in &drained {
            handle.close();
        }
        drained.len()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.handles.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }
}

// =============================================================================
// Processor Registry
// =============================================================================

/// Durable per-container state: the processor and its stop signal.
///
/// Bindings are never removed, so keyword cooldowns and buffered entries
/// survive container restarts and deselection.
#[derive(Clone)]
pub struct ProcessorBinding {
    pub processor: Arc<dyn LineProcessor>,
    pub stop: StopSignal,
    owner: Arc<AtomicU64>,
}

impl ProcessorBinding {
    pub fn new(processor: Arc<dyn LineProcessor>, stop: StopSignal) -> Self {
        Self {
            processor,
            stop,
            owner: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take ownership for a new worker. Any previous owner sees
    /// [`ProcessorBinding::is_owned_by`] turn false and winds down without
    /// touching the stop signal.
    pub fn claim(&self) -> u64 {
        self.owner.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_owned_by(&self, token: u64) -> bool {
        self.owner.load(Ordering::SeqCst) == token
    }

    /// Whether two bindings share the same underlying state.
    pub fn same_as(&self, other: &ProcessorBinding) -> bool {
        Arc::ptr_eq(&self.owner, &other.owner)
    }
}

impl std::fmt::Debug for ProcessorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorBinding")
            .field("stop", &self.stop.is_set())
            .field("owner", &self.owner.load(Ordering::SeqCst))
            .finish()
    }
}

/// Outcome of [`ProcessorRegistry::create_binding`].
#[derive(Debug)]
pub enum BindingSlot {
    /// The new binding was inserted.
    Created(ProcessorBinding),

    /// A binding already existed; it is returned unchanged.
    Existing(ProcessorBinding),
}

impl BindingSlot {
    pub fn into_binding(self) -> ProcessorBinding {
        match self {
            BindingSlot::Created(binding) | BindingSlot::Existing(binding) => binding,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, BindingSlot::Created(_))
    }
}

/// Processor bindings by container name.
#[derive(Default)]
pub struct ProcessorRegistry {
    bindings: RwLock<HashMap<String, ProcessorBinding>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<ProcessorBinding> {
        self.bindings.read().await.get(name).cloned()
    }

    /// Insert `binding` unless one already exists for `name`.
    pub async fn create_binding(&self, name: &str, binding: ProcessorBinding) -> BindingSlot {
        let mut bindings = self.bindings.write().await;
        match bindings.get(name) {
            Some(existing) => BindingSlot::Existing(existing.clone()),
            None => {
                bindings.insert(name.to_string(), binding.clone());
                BindingSlot::Created(binding)
            }
        }
    }

    /// Snapshot of every binding.
    pub async fn all(&self) -> Vec<(String, ProcessorBinding)> {
        self.bindings
            .read()
            .await
            .iter()
            .map(|(name, binding)| (name.clone(), binding.clone()))
            .collect()
    }

    /// Set the stop signal of the binding for `name`, if any.
    pub async fn stop(&self, name: &str) {
        if let Some(binding) = self.bindings.read().await.get(name) {
            binding.stop.set();
        }
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::NoopProcessor;
    use std::time::Duration;

    fn binding() -> ProcessorBinding {
        ProcessorBinding::new(Arc::new(NoopProcessor), StopSignal::new())
    }

    #[test]
    fn test_stop_signal_toggles() {
        let stop = StopSignal::new();
        assert!(!stop.is_set());

        stop.set();
        stop.set();
        assert!(stop.is_set());

        stop.clear();
        assert!(!stop.is_set());
    }

    #[tokio::test]
    async fn test_stop_signal_wait_wakes_on_set() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.set();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_replaces_and_closes_previous_handle() {
        let registry = StreamRegistry::new();

        let first = registry.register("web").await;
        let second = registry.register("web").await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len().await, 1);

        // A stale deregistration must not remove the newer handle.
        registry.deregister("web", &first).await;
        assert!(registry.contains("web").await);

        registry.deregister("web", &second).await;
        assert!(!registry.contains("web").await);
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_waiter() {
        let registry = StreamRegistry::new();
        let handle = registry.register("web").await;

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };

        assert!(registry.close("web").await);
        assert!(!registry.close("web").await);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let registry = StreamRegistry::new();
        let handles = vec![
            registry.register("web").await,
            registry.register("db").await,
            registry.register("cache").await,
        ];

        assert_eq!(registry.close_all().await, 3);
        assert!(registry.is_empty().await);
        assert!(handles.iter().all(StreamHandle::is_closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_create_binding_succeeds_once_under_contention() {
        let registry = Arc::new(ProcessorRegistry::new());

        let attempts: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.create_binding("web", binding()).await })
            })
            .collect();

        let mut created = Vec::new();
        let mut existing = Vec::new();
        for attempt in attempts {
            match attempt.await.unwrap() {
                BindingSlot::Created(b) => created.push(b),
                BindingSlot::Existing(b) => existing.push(b),
            }
        }

        assert_eq!(created.len(), 1);
        assert_eq!(existing.len(), 31);
        assert!(existing.iter().all(|b| b.same_as(&created[0])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_binding_ownership_moves_to_latest_claim() {
        let binding = binding();

        let first = binding.claim();
        assert!(binding.is_owned_by(first));

        let second = binding.claim();
        assert!(!binding.is_owned_by(first));
        assert!(binding.is_owned_by(second));
    }
}
