//! Monitor error taxonomy.
//!
//! Worker-level errors never cross task boundaries: they are absorbed by the
//! backoff policy and turned into a retry or a worker exit. They exist as a
//! type so every state transition can be logged and classified uniformly.

use thiserror::Error;

use crate::engine::EngineError;

/// Errors raised inside the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The container was deleted. Terminal for its worker.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Network or engine hiccup. Retried with backoff.
    #[error("transient connection error: {0}")]
    TransientConnection(String),

    /// Log bytes were not valid UTF-8. Recovered by lossy decoding.
    #[error("undecodable log bytes from {container}")]
    Decode { container: String },

    /// A partial line outgrew the buffer cap. Recovered by discarding it.
    #[error("log buffer overflow for {container}: discarded {bytes} bytes")]
    BufferOverflow { container: String, bytes: usize },

    /// The backoff threshold was crossed.
    #[error("too many errors for {0}")]
    ExhaustedRetries(String),

    /// The engine stopped answering. Escalates to a full cleanup.
    #[error("engine host unreachable: {0}")]
    HostUnreachable(String),

    /// A config reload could not be applied.
    #[error("reconciliation failed: {0}")]
    Reconciliation(String),
}

impl From<EngineError> for MonitorError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(what) => MonitorError::NotFound(what),
            other => MonitorError::TransientConnection(other.to_string()),
        }
    }
}

impl MonitorError {
    /// Whether the error ends the worker without a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorError::NotFound(_)
                | MonitorError::ExhaustedRetries(_)
                | MonitorError::HostUnreachable(_)
        )
    }
}
