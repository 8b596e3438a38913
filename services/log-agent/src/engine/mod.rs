//! Container engine interface.
//!
//! The engine interface abstracts everything the monitor needs from a
//! Docker-compatible daemon:
//! - Listing and inspecting containers
//! - Following a container's log stream
//! - Following the lifecycle event feed
//! - Reachability checks
//!
//! A bollard-backed implementation talks to real daemons; an in-memory mock is
//! provided for testing and development.

mod docker;
mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use docker::DockerEngine;
pub use mock::MockEngine;

/// Errors returned by an engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The container (or other object) no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network or daemon hiccup; worth retrying.
    #[error("connection error: {0}")]
    Connection(String),

    /// Daemon answered with an error status.
    #[error("engine API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The client was closed.
    #[error("engine client closed")]
    Closed,
}

impl EngineError {
    /// Whether the error means the target object is gone for good.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Snapshot of a container's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Engine-assigned ID.
    pub id: String,

    /// Human name (without the leading slash Docker adds).
    pub name: String,

    /// Start timestamp as reported by the engine. Changes on every restart
    /// even though the ID stays the same.
    pub started_at: String,

    /// Whether the container is currently running.
    pub running: bool,
}

/// Lifecycle actions the monitor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
}

/// A container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub action: EventAction,
    pub container_id: String,
    /// Name from the event attributes, if the engine sent one.
    pub container_name: Option<String>,
}

/// Raw log bytes, chunked however the engine delivers them.
pub type LogStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Lifecycle events, already filtered to start/stop.
pub type EventStream = BoxStream<'static, Result<EngineEvent, EngineError>>;

/// Container engine interface.
#[async_trait]
pub trait Engine: Send + Sync {
    /// List running containers.
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, EngineError>;

    /// Look up a container by ID (or name).
    async fn get_container(&self, id: &str) -> Result<ContainerInfo, EngineError>;

    /// Fetch fresh metadata for a known container.
    async fn reload_metadata(&self, container: &ContainerInfo) -> Result<ContainerInfo, EngineError> {
        self.get_container(&container.id).await
    }

    /// Follow a container's logs starting at `since`.
    async fn stream_logs(&self, id: &str, since: DateTime<Utc>) -> Result<LogStream, EngineError>;

    /// Follow start/stop events starting at `since`.
    async fn stream_events(&self, since: DateTime<Utc>) -> Result<EventStream, EngineError>;

    /// Check that the daemon answers.
    async fn ping(&self) -> Result<bool, EngineError>;

    /// Release the client connection.
    async fn close(&self);
}
