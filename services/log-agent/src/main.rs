//! logwarden Log Agent
//!
//! Watches container logs on one or more engine hosts and sends keyword
//! alerts to ntfy or a webhook.
//!
//! ## Architecture
//!
//! - **Supervisors**: One per engine host; run the log workers and event watcher
//! - **Config Watcher**: Applies config file edits without a restart
//! - **Reconnect Loop**: Restarts monitoring on hosts that became reachable again

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use logwarden_agent::config::AppConfig;
use logwarden_agent::engine::{DockerEngine, Engine, EngineError};
use logwarden_agent::hosts::{self, HostSpec};
use logwarden_agent::monitor::supervisor::AGENT_SOURCE;
use logwarden_agent::monitor::Supervisor;
use logwarden_agent::notifier::{HttpNotifier, Notification, Notifier};
use logwarden_agent::processor::KeywordProcessorFactory;
use logwarden_agent::telemetry;
use logwarden_agent::watcher::{run_reconnect_loop, ConfigWatcher, MonitoredHost};

/// Pause before exiting on a bad config, so a restarting container does not
/// spin.
const CONFIG_ERROR_PAUSE: Duration = Duration::from_secs(15);

/// Pause before exiting when no host could be reached.
const NO_HOST_PAUSE: Duration = Duration::from_secs(10);

/// How often lost hosts are retried.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// Per-task join timeout on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "log-agent", version, about = "Container log keyword monitor")]
struct Args {
    /// Config file path.
    #[arg(long, env = "LOGWARDEN_CONFIG", default_value = "/config/config.yaml")]
    config: PathBuf,

    /// Comma separated engine hosts, each optionally `url|label`.
    #[arg(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // The configured level is applied once the file is loaded.
    let log_level = match telemetry::init("info") {
        Ok(log_level) => log_level,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(args, log_level).await {
        Ok(code) => code,
        Err(e) => {
            error!("Log agent failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, log_level: telemetry::LogLevel) -> Result<ExitCode> {
    info!(config = %args.config.display(), "Starting logwarden log agent");

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Error loading config");
            tokio::time::sleep(CONFIG_ERROR_PAUSE).await;
            return Ok(ExitCode::FAILURE);
        }
    };
    log_level.apply(&config.settings.log_level);

    let notifier: Arc<dyn Notifier> =
        Arc::new(HttpNotifier::new().context("failed to build HTTP client")?);

    let specs = hosts::resolve_hosts(args.docker_host.as_deref());
    let hosts = Arc::new(start_hosts(&specs, &config, &notifier).await);
    if hosts.is_empty() {
        error!("Could not connect to any engine host");
        tokio::time::sleep(NO_HOST_PAUSE).await;
        return Ok(ExitCode::FAILURE);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher_handle = config.settings.reload_config.then(|| {
        let watcher = ConfigWatcher::new(args.config.clone(), Arc::clone(&hosts), Arc::clone(&notifier))
            .with_log_level(log_level.clone());
        tokio::spawn(watcher.run(shutdown_rx.clone()))
    });

    let reconnect_handle = tokio::spawn(run_reconnect_loop(
        Arc::clone(&hosts),
        connect,
        RECONNECT_INTERVAL,
        shutdown_rx.clone(),
    ));

    wait_for_signal().await;
    info!("Received shutdown signal");

    // Read the file once more; the shutdown toggle may have changed.
    let final_config = AppConfig::load(&args.config).unwrap_or(config);
    if !final_config.settings.disable_shutdown_message {
        let notification = Notification {
            source: AGENT_SOURCE.to_string(),
            title: "LogWarden".to_string(),
            body: "Shutting down".to_string(),
            keywords: Vec::new(),
            hostname: None,
        };
        notifier.notify(&final_config, notification).await;
    }

    let _ = shutdown_tx.send(true);
    join_all(hosts.iter().map(|host| host.supervisor.cleanup(SHUTDOWN_TIMEOUT))).await;

    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }
    let _ = reconnect_handle.await;

    info!("Log agent shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Connect to every reachable host and start its supervisor.
async fn start_hosts(
    specs: &[HostSpec],
    config: &AppConfig,
    notifier: &Arc<dyn Notifier>,
) -> Vec<MonitoredHost> {
    let mut started = Vec::new();
    let multiple = specs.len() > 1;

    for (index, spec) in specs.iter().enumerate() {
        let engine = match DockerEngine::connect(&spec.url) {
            Ok(engine) => engine,
            Err(e) => {
                error!(host = %spec.url, error = %e, "Could not create engine client");
                continue;
            }
        };
        match engine.ping().await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                warn!(host = %spec.url, "Engine host is not reachable, skipping");
                continue;
            }
        }

        let hostname = host_label(spec, &engine, multiple, index + 1).await;
        let factory = Arc::new(KeywordProcessorFactory::new(
            Arc::clone(notifier),
            hostname.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            config.clone(),
            spec.url.clone(),
            hostname.clone(),
            factory,
            Arc::clone(notifier),
        ));

        let engine: Arc<dyn Engine> = Arc::new(engine);
        match supervisor.start(engine).await {
            Ok(()) => started.push(MonitoredHost {
                spec: spec.clone(),
                supervisor,
            }),
            Err(e) => error!(host = %spec.url, error = %e, "Failed to start monitoring"),
        }
    }

    started
}

/// Notification label for a host. Only set when several hosts are monitored
/// or the host was labelled explicitly.
async fn host_label(spec: &HostSpec, engine: &DockerEngine, multiple: bool, number: usize) -> Option<String> {
    if let Some(label) = &spec.label {
        return Some(label.clone());
    }
    if !multiple {
        return None;
    }
    match engine.daemon_name().await {
        Ok(name) => Some(name),
        Err(e) => {
            warn!(host = %spec.url, error = %e, "Could not read daemon name");
            Some(hosts::fallback_label(number))
        }
    }
}

fn connect(spec: &HostSpec) -> Result<Arc<dyn Engine>, EngineError> {
    let engine: Arc<dyn Engine> = Arc::new(DockerEngine::connect(&spec.url)?);
    Ok(engine)
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
