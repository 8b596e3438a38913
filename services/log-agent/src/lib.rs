//! logwarden Log Agent Library
//!
//! The log agent follows the log output of selected containers on one or more
//! engine hosts and raises notifications when configured keywords or regular
//! expressions show up.
//!
//! ## Architecture
//!
//! One supervisor per engine host owns every task for that host:
//!
//! ```text
//! Supervisor(host)
//! ├── EventWatcher        (container start/stop feed)
//! └── Worker(container)   (log stream → line framer → line processor)
//!
//! ConfigWatcher           (hot reload, shared by all hosts)
//! ReconnectLoop           (restarts hosts that went away)
//! ```
//!
//! ## Modules
//!
//! - `engine`: Engine interface, bollard implementation and in-memory mock
//! - `monitor`: Supervisor, workers, event watcher, backoff and registries
//! - `processor`: Keyword matching with cooldowns and multi-line grouping
//! - `notifier`: ntfy and webhook delivery

pub mod config;
pub mod engine;
pub mod error;
pub mod hosts;
pub mod monitor;
pub mod notifier;
pub mod processor;
pub mod telemetry;
pub mod watcher;

// Re-export commonly used types
pub use config::AppConfig;
pub use engine::{ContainerInfo, DockerEngine, Engine, EngineError, MockEngine};
pub use error::MonitorError;
pub use monitor::Supervisor;
pub use notifier::{HttpNotifier, Notification, Notifier};
pub use processor::{KeywordProcessorFactory, LineProcessor, ProcessorFactory};
