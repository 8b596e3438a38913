//! Docker engine client.
//!
//! Talks to a Docker-compatible daemon over a Unix socket or TCP using
//! bollard. Podman's Docker API socket works the same way.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{ContainerInfo, Engine, EngineError, EngineEvent, EventAction, EventStream, LogStream};

/// Request timeout in seconds. Podman applies the client timeout to log
/// streams as well, so this has to be generous.
const CLIENT_TIMEOUT_SECS: u64 = 300;

/// Engine backed by a Docker daemon.
pub struct DockerEngine {
    /// Daemon address as configured (`unix://...`, `tcp://...`).
    host: String,

    /// Live client; `None` once closed.
    docker: ArcSwapOption<Docker>,
}

impl DockerEngine {
    /// Connect to the daemon at `host`.
    ///
    /// Accepts `unix://` socket paths and `tcp://` or `http://` addresses. An
    /// empty host uses the local defaults (`DOCKER_HOST` or the default socket).
    pub fn connect(host: &str) -> Result<Self, EngineError> {
        let docker = if host.is_empty() {
            Docker::connect_with_local_defaults()?
        } else if host.starts_with("unix://") {
            Docker::connect_with_unix(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        };

        debug!(host = %host, "Docker client created");

        Ok(Self {
            host: host.to_string(),
            docker: ArcSwapOption::from_pointee(docker),
        })
    }

    /// Daemon address this engine was created for.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Name the daemon reports for itself, used as a host label.
    pub async fn daemon_name(&self) -> Result<String, EngineError> {
        let docker = self.client()?;
        let info = docker.info().await?;
        info.name
            .ok_or_else(|| EngineError::Api { status: 0, message: "daemon did not report a name".to_string() })
    }

    fn client(&self) -> Result<Arc<Docker>, EngineError> {
        self.docker.load_full().ok_or(EngineError::Closed)
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn list_running(&self) -> Result<Vec<ContainerInfo>, EngineError> {
        let docker = self.client()?;
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = docker.list_containers(Some(options)).await?;

        // The list endpoint does not carry the start time, so each container
        // is inspected individually.
        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|s| s.id) {
            match self.get_container(&id).await {
                Ok(info) => containers.push(info),
                Err(e) if e.is_not_found() => {
                    debug!(container_id = %id, "Container vanished while listing");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(containers)
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let docker = self.client()?;
        let inspect = docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(container_info(inspect))
    }

    async fn stream_logs(&self, id: &str, since: DateTime<Utc>) -> Result<LogStream, EngineError> {
        let docker = self.client()?;
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since: since.timestamp(),
            ..Default::default()
        };

        let stream = docker
            .logs(id, Some(options))
            .map(|item| item.map(LogOutput::into_bytes).map_err(EngineError::from))
            .boxed();

        Ok(stream)
    }

    async fn stream_events(&self, since: DateTime<Utc>) -> Result<EventStream, EngineError> {
        let docker = self.client()?;

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "stop".to_string()],
        );
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        // The daemon starts the feed at subscription time; `since` only drops
        // anything older that slips through.
        let since = since.timestamp();
        let stream = docker
            .events(Some(options))
            .filter_map(move |item| async move {
                match item {
                    Ok(message) => engine_event(message, since).map(Ok),
                    Err(e) => Some(Err(EngineError::from(e))),
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn ping(&self) -> Result<bool, EngineError> {
        let docker = self.client()?;
        docker.ping().await?;
        Ok(true)
    }

    async fn close(&self) {
        if self.docker.swap(None).is_some() {
            info!(host = %self.host, "Docker client closed");
        }
    }
}

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            other => EngineError::Connection(other.to_string()),
        }
    }
}

fn container_info(inspect: ContainerInspectResponse) -> ContainerInfo {
    let state = inspect.state.unwrap_or_default();
    let name = inspect.name.unwrap_or_default();

    ContainerInfo {
        id: inspect.id.unwrap_or_default(),
        name: name.trim_start_matches('/').to_string(),
        started_at: state.started_at.unwrap_or_default(),
        running: state.running.unwrap_or(false),
    }
}

fn engine_event(message: EventMessage, since: i64) -> Option<EngineEvent> {
    if message.time.is_some_and(|t| t < since) {
        return None;
    }

    let action = match message.action.as_deref()? {
        "start" => EventAction::Start,
        "stop" => EventAction::Stop,
        _ => return None,
    };

    let actor = message.actor?;
    let container_id = actor.id?;
    let container_name = actor.attributes.and_then(|mut attrs| attrs.remove("name"));

    Some(EngineEvent {
        action,
        container_id,
        container_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerState, EventActor};

    #[test]
    fn test_container_info_strips_leading_slash() {
        let inspect = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/web".to_string()),
            state: Some(ContainerState {
                running: Some(true),
                started_at: Some("2024-01-01T00:00:00Z".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = container_info(inspect);
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "web");
        assert!(info.running);
        assert_eq!(info.started_at, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_engine_event_mapping() {
        let message = EventMessage {
            action: Some("stop".to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                attributes: Some(HashMap::from([("name".to_string(), "web".to_string())])),
            }),
            time: Some(200),
            ..Default::default()
        };

        let event = engine_event(message, 100).unwrap();
        assert_eq!(event.action, EventAction::Stop);
        assert_eq!(event.container_id, "abc123");
        assert_eq!(event.container_name.as_deref(), Some("web"));
    }

    #[test]
    fn test_engine_event_ignores_other_actions_and_old_events() {
        let die = EventMessage {
            action: Some("die".to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };
        assert!(engine_event(die, 0).is_none());

        let old = EventMessage {
            action: Some("start".to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                attributes: None,
            }),
            time: Some(50),
            ..Default::default()
        };
        assert!(engine_event(old, 100).is_none());
    }

    #[test]
    fn test_not_found_classification() {
        let err = EngineError::from(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        });
        assert!(err.is_not_found());

        let err = EngineError::from(BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        });
        assert!(!err.is_not_found());
    }
}
