//! Log stream worker: one task per monitored container.
//!
//! ```text
//! STARTING ──► STREAMING ──► (RECONNECTING ──► STREAMING)* ──► STOPPED
//! ```
//!
//! The worker reads raw chunks, frames them into lines and feeds its
//! container's processor. A stream that ends or fails is reopened only while
//! the container is still the same running instance; a stopped, deleted or
//! restarted container ends the worker (the event watcher starts a new one
//! when the container comes back).

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::backoff::ErrorWindow;
use super::framing::LineFramer;
use super::registry::{ProcessorBinding, StreamHandle};
use super::supervisor::Supervisor;
use crate::engine::{ContainerInfo, LogStream};
use crate::error::MonitorError;

/// Why a read pass over one stream ended.
#[derive(Debug)]
enum StreamEnd {
    /// The engine closed the stream.
    Ended,
    /// The stream handle was closed from outside.
    Closed,
    /// Global shutdown.
    Shutdown,
    /// Read error.
    Failed(MonitorError),
}

/// Monitor `container` until it stops, disappears or shutdown begins.
pub(crate) async fn run(supervisor: Arc<Supervisor>, container: ContainerInfo) {
    let name = container.name.clone();

    // STARTING
    let (binding, reused) = supervisor.binding_for(&name).await;
    let token = binding.claim();
    binding.stop.clear();
    if reused {
        debug!(container = %name, "Reusing line processor");
        binding.processor.resume_flush_timer().await;
    }
    info!(container = %name, started_at = %container.started_at, "Monitoring started");

    let mut shutdown = supervisor.shutdown_signal();
    let mut errors = ErrorWindow::new(Instant::now());
    let mut framer = LineFramer::new();

    while !supervisor.is_shutdown() && !binding.stop.is_set() && binding.is_owned_by(token) {
        let Some(engine) = supervisor.engine().await else {
            break;
        };

        // STREAMING
        let stream = match engine.stream_logs(&container.id, Utc::now()).await {
            Ok(stream) => stream,
            Err(e) if e.is_not_found() => {
                error!(container = %name, error = %e, "Container not found, stopping monitoring");
                break;
            }
            Err(e) => {
                if supervisor.handle_error(&mut errors, &name, &MonitorError::from(e)).await {
                    break;
                }
                continue;
            }
        };

        let handle = supervisor.register_stream(&name).await;
        if supervisor.is_shutdown() || binding.stop.is_set() || !binding.is_owned_by(token) {
            supervisor.deregister_stream(&name, &handle).await;
            break;
        }
        info!(container = %name, "Log stream started");

        framer.reset();
        let end = read_stream(stream, &handle, &mut shutdown, &mut framer, &binding, &name).await;
        supervisor.deregister_stream(&name, &handle).await;

        // RECONNECTING
        match end {
            StreamEnd::Shutdown => break,
            StreamEnd::Failed(e) if e.is_terminal() => {
                error!(container = %name, error = %e, "Log stream failed, stopping monitoring");
                break;
            }
            StreamEnd::Failed(e) => {
                if supervisor.handle_error(&mut errors, &name, &e).await {
                    break;
                }
            }
            StreamEnd::Ended | StreamEnd::Closed => {}
        }

        if supervisor.is_shutdown() {
            break;
        }
        if binding.stop.is_set() || !binding.is_owned_by(token) {
            debug!(container = %name, "Stop requested");
            break;
        }
        if !still_running(&supervisor, &container, errors.count).await {
            break;
        }

        info!(container = %name, errors = errors.count, "Log stream stopped, reconnecting");
    }

    // STOPPED. A newer worker owns the binding once ownership moved; leave
    // its signal and its monitored entry alone.
    if binding.is_owned_by(token) {
        binding.stop.set();
        supervisor.forget_instance(&container).await;
    }
    info!(container = %name, "Monitoring stopped");
}

/// Read chunks until the stream ends, fails, is closed or shutdown begins.
async fn read_stream(
    mut stream: LogStream,
    handle: &StreamHandle,
    shutdown: &mut watch::Receiver<bool>,
    framer: &mut LineFramer,
    binding: &ProcessorBinding,
    name: &str,
) -> StreamEnd {
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return StreamEnd::Shutdown;
                }
            }

            _ = handle.closed() => return StreamEnd::Closed,

            item = stream.next() => match item {
                Some(Ok(chunk)) => dispatch(framer, &chunk, binding, name).await,
                Some(Err(e)) => return StreamEnd::Failed(e.into()),
                None => return StreamEnd::Ended,
            },
        }
    }
}

/// Frame a chunk and hand every complete line to the processor, in order.
async fn dispatch(framer: &mut LineFramer, chunk: &[u8], binding: &ProcessorBinding, name: &str) {
    let framed = framer.push(chunk);

    for line in framed.lines {
        if line.lossy {
            let e = MonitorError::Decode {
                container: name.to_string(),
            };
            warn!(error = %e, line = %line.text, "Replaced invalid UTF-8 in log line");
        }
        binding.processor.process_line(&line.text).await;
    }

    if framed.discarded > 0 {
        let e = MonitorError::BufferOverflow {
            container: name.to_string(),
            bytes: framed.discarded,
        };
        error!(error = %e, "Log line too long, buffer reset");
    }
}

/// Whether the container is still the running instance this worker started
/// for. Connection problems count as running; the next read decides.
async fn still_running(supervisor: &Supervisor, container: &ContainerInfo, error_count: u32) -> bool {
    let Some(engine) = supervisor.engine().await else {
        return false;
    };

    match engine.reload_metadata(container).await {
        Ok(fresh) if !fresh.running => {
            debug!(container = %container.name, "Container is not running, stopping monitoring");
            false
        }
        Ok(fresh) if fresh.started_at != container.started_at => {
            debug!(container = %container.name, "Container was restarted, stopping monitoring");
            false
        }
        Ok(_) => true,
        Err(e) if e.is_not_found() => {
            error!(container = %container.name, "Container not found during check, stopping monitoring");
            false
        }
        Err(e) => {
            if error_count <= 1 {
                error!(container = %container.name, error = %e, "Could not check container");
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::registry::{StopSignal, StreamRegistry};
    use crate::processor::NoopProcessor;
    use std::future::Future;
    use std::time::Duration;

    fn assert_spawnable<A, Fut>(_: impl Fn(Arc<Supervisor>, A) -> Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
    }

    #[test]
    fn test_task_futures_are_send() {
        assert_spawnable(run);
        assert_spawnable(|supervisor, _: ()| crate::monitor::events::run(supervisor));
    }

    #[tokio::test]
    async fn test_read_stream_ends_only_when_shutdown_is_set() {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let handle = StreamRegistry::new().register("web").await;
        let binding = ProcessorBinding::new(Arc::new(NoopProcessor), StopSignal::new());

        let reader = tokio::spawn(async move {
            let stream: LogStream = futures_util::stream::pending().boxed();
            let mut framer = LineFramer::new();
            read_stream(stream, &handle, &mut shutdown, &mut framer, &binding, "web").await
        });

        // A change that leaves the flag clear keeps the stream open.
        shutdown_tx.send_replace(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        shutdown_tx.send_replace(true);
        let end = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, StreamEnd::Shutdown));
    }
}
