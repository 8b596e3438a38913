//! Container log monitoring.
//!
//! ## Structure
//!
//! ```text
//! Supervisor (per host)
//! ├── EventWatcher          (start/stop feed)
//! └── Worker(container)     (log stream → framer → processor)
//! ```
//!
//! Workers and the watcher share one [`BackoffPolicy`]. The supervisor owns
//! the [`StreamRegistry`] and [`ProcessorRegistry`] and hands out narrow
//! accessors; no map is shared directly.

pub mod backoff;
mod events;
pub mod framing;
pub mod registry;
pub mod supervisor;
mod worker;

pub use backoff::{BackoffDecision, BackoffPolicy, ErrorWindow, Jitter};
pub use framing::{LineFramer, MAX_BUFFER_SIZE};
pub use registry::{
    BindingSlot, ProcessorBinding, ProcessorRegistry, StopSignal, StreamHandle, StreamRegistry,
};
pub use supervisor::Supervisor;
