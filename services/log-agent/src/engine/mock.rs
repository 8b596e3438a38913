//! In-memory engine for tests and development.
//!
//! Containers, log chunks and lifecycle events are injected by the caller.
//! Every opened log or event stream is backed by an unbounded channel, so
//! pushing data reaches all currently open readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{ContainerInfo, Engine, EngineError, EngineEvent, EventAction, EventStream, LogStream};

type LogSender = mpsc::UnboundedSender<Result<Bytes, EngineError>>;
type EventSender = mpsc::UnboundedSender<Result<EngineEvent, EngineError>>;

#[derive(Default)]
struct MockState {
    containers: HashMap<String, ContainerInfo>,
    log_senders: HashMap<String, Vec<LogSender>>,
    event_senders: Vec<EventSender>,
    log_opens: HashMap<String, usize>,
    event_opens: usize,
    failing_logs: HashMap<String, EngineError>,
    failing_events: Option<EngineError>,
    unreachable: bool,
    close_delay: Option<Duration>,
    closed: bool,
}

/// Mock engine.
pub struct MockEngine {
    state: Mutex<MockState>,

    /// Counter for generating start timestamps.
    boot_counter: AtomicU64,
}

impl MockEngine {
    /// Create an engine with no containers.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            boot_counter: AtomicU64::new(0),
        }
    }

    fn next_start_time(&self) -> String {
        let boot = self.boot_counter.fetch_add(1, Ordering::SeqCst);
        format!("2024-01-01T00:00:{:02}.{:09}Z", boot % 60, boot)
    }

    /// Add a running container.
    pub async fn add_container(&self, id: &str, name: &str) -> ContainerInfo {
        let info = ContainerInfo {
            id: id.to_string(),
            name: name.to_string(),
            started_at: self.next_start_time(),
            running: true,
        };
        self.state
            .lock()
            .await
            .containers
            .insert(id.to_string(), info.clone());
        info
    }

    /// Mark a container stopped without emitting an event.
    pub async fn stop_container(&self, id: &str) {
        if let Some(container) = self.state.lock().await.containers.get_mut(id) {
            container.running = false;
        }
    }

    /// Mark a container running again with a fresh start time.
    pub async fn restart_container(&self, id: &str) {
        let started_at = self.next_start_time();
        if let Some(container) = self.state.lock().await.containers.get_mut(id) {
            container.running = true;
            container.started_at = started_at;
        }
    }

    /// Delete a container entirely.
    pub async fn remove_container(&self, id: &str) {
        self.state.lock().await.containers.remove(id);
    }

    /// Deliver a chunk to every open log stream of a container.
    ///
    /// Returns the number of streams that received it.
    pub async fn push_logs(&self, id: &str, chunk: &[u8]) -> usize {
        let mut state = self.state.lock().await;
        let Some(senders) = state.log_senders.get_mut(id) else {
            return 0;
        };
        senders.retain(|tx| tx.send(Ok(Bytes::copy_from_slice(chunk))).is_ok());
        senders.len()
    }

    /// End every open log stream of a container (as the daemon does when
    /// the container exits).
    pub async fn end_log_streams(&self, id: &str) {
        self.state.lock().await.log_senders.remove(id);
    }

    /// Fail every open log stream of a container with `error`.
    pub async fn break_log_streams(&self, id: &str, error: EngineError) {
        if let Some(senders) = self.state.lock().await.log_senders.remove(id) {
            for tx in senders {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Make future log stream opens for a container fail (`None` to heal).
    pub async fn fail_log_opens(&self, id: &str, error: Option<EngineError>) {
        let mut state = self.state.lock().await;
        match error {
            Some(error) => state.failing_logs.insert(id.to_string(), error),
            None => state.failing_logs.remove(id),
        };
    }

    /// Make future event feed opens fail (`None` to heal).
    pub async fn fail_event_opens(&self, error: Option<EngineError>) {
        self.state.lock().await.failing_events = error;
    }

    /// Send a lifecycle event to every open event feed.
    ///
    /// Returns the number of feeds that received it.
    pub async fn emit_event(&self, action: EventAction, id: &str) -> usize {
        let mut state = self.state.lock().await;
        let container_name = state.containers.get(id).map(|c| c.name.clone());
        let event = EngineEvent {
            action,
            container_id: id.to_string(),
            container_name,
        };
        state
            .event_senders
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
        state.event_senders.len()
    }

    /// Toggle whether pings succeed.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.unreachable = !reachable;
    }

    /// Make `close` take `delay` before it releases anything.
    pub async fn set_close_delay(&self, delay: Duration) {
        self.state.lock().await.close_delay = Some(delay);
    }

    /// Number of log streams opened for a container so far.
    pub async fn log_stream_opens(&self, id: &str) -> usize {
        self.state
            .lock()
            .await
            .log_opens
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of event feeds opened so far.
    pub async fn event_stream_opens(&self) -> usize {
        self.state.lock().await.event_opens
    }

    /// Number of event feeds with a live reader.
    pub async fn event_subscribers(&self) -> usize {
        let mut state = self.state.lock().await;
        state.event_senders.retain(|tx| !tx.is_closed());
        state.event_senders.len()
    }

    /// Number of log streams of a container with a live reader.
    pub async fn log_subscribers(&self, id: &str) -> usize {
        let mut state = self.state.lock().await;
        match state.log_senders.get_mut(id) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Whether `close()` has been called.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, EngineError> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(EngineError::Connection("[MOCK] engine unreachable".to_string()));
        }

        let mut running: Vec<_> = state
            .containers
            .values()
            .filter(|c| c.running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(running)
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(EngineError::Connection("[MOCK] engine unreachable".to_string()));
        }

        state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {id}")))
    }

    async fn stream_logs(&self, id: &str, _since: DateTime<Utc>) -> Result<LogStream, EngineError> {
        let mut state = self.state.lock().await;
        *state.log_opens.entry(id.to_string()).or_default() += 1;

        if let Some(error) = state.failing_logs.get(id) {
            return Err(error.clone());
        }
        if !state.containers.contains_key(id) {
            return Err(EngineError::NotFound(format!("no such container: {id}")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.log_senders.entry(id.to_string()).or_default().push(tx);

        debug!(container_id = %id, "[MOCK] Log stream opened");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stream_events(&self, _since: DateTime<Utc>) -> Result<EventStream, EngineError> {
        let mut state = self.state.lock().await;
        state.event_opens += 1;

        if let Some(error) = &state.failing_events {
            return Err(error.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.event_senders.push(tx);

        debug!("[MOCK] Event stream opened");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn ping(&self) -> Result<bool, EngineError> {
        Ok(!self.state.lock().await.unreachable)
    }

    async fn close(&self) {
        let delay = self.state.lock().await.close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        state.closed = true;
        state.log_senders.clear();
        state.event_senders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_engine_lists_only_running() {
        let engine = MockEngine::new();
        engine.add_container("c1", "web").await;
        engine.add_container("c2", "db").await;
        engine.stop_container("c2").await;

        let running = engine.list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "web");
    }

    #[tokio::test]
    async fn test_mock_engine_restart_changes_start_time() {
        let engine = MockEngine::new();
        let before = engine.add_container("c1", "web").await;
        engine.restart_container("c1").await;

        let after = engine.get_container("c1").await.unwrap();
        assert_eq!(before.id, after.id);
        assert_ne!(before.started_at, after.started_at);
    }

    #[tokio::test]
    async fn test_mock_engine_log_stream() {
        let engine = MockEngine::new();
        engine.add_container("c1", "web").await;

        let mut stream = engine.stream_logs("c1", Utc::now()).await.unwrap();
        assert_eq!(engine.push_logs("c1", b"hello\n").await, 1);

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello\n");

        engine.end_log_streams("c1").await;
        assert!(stream.next().await.is_none());
        assert_eq!(engine.log_stream_opens("c1").await, 1);
    }

    #[tokio::test]
    async fn test_mock_engine_missing_container() {
        let engine = MockEngine::new();
        let result = engine.stream_logs("nope", Utc::now()).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
