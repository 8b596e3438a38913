//! Background loops that run next to the supervisors.
//!
//! - [`ConfigWatcher`]: polls the config file and hot-reloads it
//! - [`run_reconnect_loop`]: restarts supervisors whose host was lost

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::engine::{Engine, EngineError};
use crate::hosts::HostSpec;
use crate::monitor::supervisor::AGENT_SOURCE;
use crate::monitor::Supervisor;
use crate::notifier::{Notification, Notifier};
use crate::telemetry::LogLevel;

/// A supervisor together with the host it monitors.
pub struct MonitoredHost {
    pub spec: HostSpec,
    pub supervisor: Arc<Supervisor>,
}

// =============================================================================
// Config Watcher
// =============================================================================

/// Watches the config file and applies changes to every supervisor.
pub struct ConfigWatcher {
    path: PathBuf,
    hosts: Arc<Vec<MonitoredHost>>,
    notifier: Arc<dyn Notifier>,
    log_level: Option<LogLevel>,

    /// How often the file is checked.
    poll_interval: Duration,

    /// How long the file has to stay unchanged before it is reloaded.
    debounce: Duration,
}

/// File identity used to detect writes.
type Fingerprint = Option<(SystemTime, u64)>;

impl ConfigWatcher {
    pub fn new(path: PathBuf, hosts: Arc<Vec<MonitoredHost>>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            path,
            hosts,
            notifier,
            log_level: None,
            poll_interval: Duration::from_millis(500),
            debounce: Duration::from_secs(2),
        }
    }

    /// Re-apply `settings.log_level` on every reload.
    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = Some(log_level);
        self
    }

    pub fn with_timing(mut self, poll_interval: Duration, debounce: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.debounce = debounce;
        self
    }

    /// Poll until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), "Watching config file");

        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut last_seen = self.fingerprint().await;
        let mut changed_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            let current = self.fingerprint().await;
            if current != last_seen {
                last_seen = current;
                changed_at = Some(Instant::now());
                continue;
            }

            if changed_at.is_some_and(|at| at.elapsed() >= self.debounce) {
                changed_at = None;
                self.reload().await;
            }
        }

        debug!("Config watcher stopped");
    }

    async fn fingerprint(&self) -> Fingerprint {
        let metadata = tokio::fs::metadata(&self.path).await.ok()?;
        Some((metadata.modified().ok()?, metadata.len()))
    }

    async fn reload(&self) {
        info!(path = %self.path.display(), "Config change detected, reloading");

        let config = match AppConfig::load(&self.path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to reload config, keeping the previous one");
                return;
            }
        };

        if let Some(log_level) = &self.log_level {
            log_level.apply(&config.settings.log_level);
        }

        for host in self.hosts.iter() {
            host.supervisor.reload_config(Some(config.clone())).await;
        }

        if !config.settings.disable_config_reload_message {
            let notification = Notification {
                source: AGENT_SOURCE.to_string(),
                title: "LogWarden".to_string(),
                body: "The config file was reloaded".to_string(),
                keywords: Vec::new(),
                hostname: None,
            };
            self.notifier.notify(&config, notification).await;
        }
    }
}

// =============================================================================
// Reconnect Loop
// =============================================================================

/// Every `interval`, reconnect hosts whose supervisor shut down after losing
/// the engine.
pub async fn run_reconnect_loop<F>(
    hosts: Arc<Vec<MonitoredHost>>,
    connect: F,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn(&HostSpec) -> Result<Arc<dyn Engine>, EngineError> + Send + Sync,
{
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        for host in hosts.iter() {
            if *shutdown.borrow() {
                return;
            }
            if !host.supervisor.needs_reconnect() {
                continue;
            }
            reconnect(host, &connect).await;
        }
    }

    debug!("Reconnect loop stopped");
}

async fn reconnect<F>(host: &MonitoredHost, connect: &F)
where
    F: Fn(&HostSpec) -> Result<Arc<dyn Engine>, EngineError>,
{
    let engine = match connect(&host.spec) {
        Ok(engine) => engine,
        Err(e) => {
            warn!(host = %host.spec.url, error = %e, "Could not reconnect");
            return;
        }
    };

    match engine.ping().await {
        Ok(true) => {}
        Ok(false) => {
            warn!(host = %host.spec.url, "Host still unreachable");
            return;
        }
        Err(e) => {
            warn!(host = %host.spec.url, error = %e, "Host still unreachable");
            return;
        }
    }

    info!(host = %host.spec.url, "Reconnected to engine host");
    if let Err(e) = host.supervisor.start(engine).await {
        error!(host = %host.spec.url, error = %e, "Failed to restart monitoring");
        return;
    }
    host.supervisor.reload_config(None).await;
}
