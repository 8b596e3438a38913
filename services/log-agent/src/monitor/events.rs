//! Engine event watcher.
//!
//! A single task per host follows the engine's start/stop feed:
//! - `start` of a selected container spawns a worker for it
//! - `stop` of a monitored container closes its stream, which ends the worker
//!
//! The feed read races the shutdown signal, so cleanup can always join this
//! task.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use super::backoff::ErrorWindow;
use super::supervisor::Supervisor;
use crate::engine::{Engine, EngineEvent, EventAction};
use crate::error::MonitorError;

const SOURCE: &str = "event watcher";

/// Follow the event feed until shutdown or until retries are exhausted.
pub(crate) async fn run(supervisor: Arc<Supervisor>) {
    let mut shutdown = supervisor.shutdown_signal();
    let mut errors = ErrorWindow::new(Instant::now());

    while !supervisor.is_shutdown() {
        let Some(engine) = supervisor.engine().await else {
            break;
        };

        let mut events = match engine.stream_events(Utc::now()).await {
            Ok(events) => events,
            Err(e) => {
                if supervisor.handle_error(&mut errors, SOURCE, &MonitorError::from(e)).await {
                    break;
                }
                continue;
            }
        };
        info!(host = %supervisor.host(), "Watching for container events");

        let failure = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break None;
                    }
                }

                item = events.next() => match item {
                    Some(Ok(event)) => handle_event(&supervisor, engine.as_ref(), event).await,
                    Some(Err(e)) => break Some(MonitorError::from(e)),
                    None => break None,
                },
            }
        };
        drop(events);

        if supervisor.is_shutdown() {
            break;
        }
        if let Some(e) = failure {
            if supervisor.handle_error(&mut errors, SOURCE, &e).await {
                break;
            }
        }

        info!(host = %supervisor.host(), errors = errors.count, "Event feed stopped, reconnecting");
    }

    info!(host = %supervisor.host(), "Event watcher stopped");
}

async fn handle_event(supervisor: &Arc<Supervisor>, engine: &dyn Engine, event: EngineEvent) {
    match event.action {
        EventAction::Start => {
            let container = match engine.get_container(&event.container_id).await {
                Ok(container) => container,
                Err(e) if e.is_not_found() => {
                    warn!(container_id = %event.container_id, "Started container vanished");
                    return;
                }
                Err(e) => {
                    error!(container_id = %event.container_id, error = %e, "Could not inspect started container");
                    return;
                }
            };

            let config = supervisor.config();
            if !config.is_selected(&container.name) {
                debug!(container = %container.name, "Ignoring start of unselected container");
                return;
            }

            let name = container.name.clone();
            if supervisor.monitor(container).await {
                info!(container = %name, "Monitoring new container");
                if !config.settings.disable_container_event_message {
                    supervisor.notify("LogWarden", format!("Monitoring new container: {name}"));
                }
            }
        }
        EventAction::Stop => {
            if let Some(container) = supervisor.forget(&event.container_id).await {
                info!(container = %container.name, "Container stopped");
                supervisor.close_stream(&container.name).await;
            }
        }
    }
}
