//! Logging initialization.
//!
//! JSON logs to stdout. `RUST_LOG` wins when set; otherwise the level comes
//! from `settings.log_level` and follows config reloads.

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Runtime control over the log level.
#[derive(Clone)]
pub struct LogLevel {
    /// `None` when `RUST_LOG` pins the filter.
    handle: Option<FilterHandle>,
}

impl LogLevel {
    /// Switch to `level` unless `RUST_LOG` pins the filter.
    pub fn apply(&self, level: &str) {
        let Some(handle) = &self.handle else {
            return;
        };

        let directive = directive(level);
        match handle.reload(EnvFilter::new(directive)) {
            Ok(()) => info!(level = %directive, "Log level set"),
            Err(e) => warn!(error = %e, "Failed to change log level"),
        }
    }
}

/// Install the global subscriber.
pub fn init(level: &str) -> anyhow::Result<LogLevel> {
    let (filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(directive(level)), false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()?;

    Ok(LogLevel {
        handle: (!pinned).then_some(handle),
    })
}

/// Filter directive for a configured level name; unknown names mean `info`.
fn directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        "off" => "off",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DEBUG", "debug")]
    #[case(" info ", "info")]
    #[case("warning", "warn")]
    #[case("critical", "error")]
    #[case("verbose", "info")]
    fn test_level_directive(#[case] level: &str, #[case] expected: &str) {
        assert_eq!(directive(level), expected);
    }

    #[test]
    fn test_pinned_level_ignores_apply() {
        LogLevel { handle: None }.apply("trace");
    }
}
