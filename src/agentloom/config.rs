//! Runtime configuration.
//!
//! Provides the [`RuntimeConfig`] struct with every tunable the runtime
//! consults: wait timeouts, meeting batching windows, the artifact
//! promotion threshold, and retry policy. Users construct it manually — no
//! file parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use agentloom::config::RuntimeConfig;
//! use std::time::Duration;
//!
//! // Defaults match the documented runtime behavior.
//! let config = RuntimeConfig::default();
//! assert_eq!(config.agent_wait_timeout, Duration::from_secs(5));
//!
//! // Or tighten the meeting batching for tests.
//! let config = RuntimeConfig {
//!     meeting_rolling_timeout: Duration::from_millis(100),
//!     meeting_max_batch_wait: Duration::from_millis(300),
//!     ..RuntimeConfig::default()
//! };
//! assert!(config.meeting_max_batch_wait > config.meeting_rolling_timeout);
//! ```

use std::time::Duration;

/// Tunables for a program run.
///
/// This struct is intentionally plain; construct it with struct-update
/// syntax over [`RuntimeConfig::default`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long a `Yield(WaitForAgent)` waits for the reply before the
    /// progressive-timeout notification is delivered to the executor.
    pub agent_wait_timeout: Duration,

    /// Rolling window of the meeting batch collector: each broadcast within
    /// the window restarts it.
    pub meeting_rolling_timeout: Duration,

    /// Absolute cap on how long a meeting batch may keep growing before it
    /// is force-flushed, regardless of rolling activity.
    pub meeting_max_batch_wait: Duration,

    /// Grace window the event bus allows in-flight handler tasks at close.
    pub bus_close_grace: Duration,

    /// Serialized length above which a `SetVariable` value is promoted to an
    /// artifact.
    pub artifact_threshold: usize,

    /// Per-agent inbox cap. `None` (the default) keeps inboxes unbounded;
    /// `Some(n)` drops the oldest message on overflow.
    pub inbox_capacity: Option<usize>,

    /// How many times a transient executor failure is attempted before it
    /// becomes fatal.
    pub executor_max_attempts: u32,

    /// Base delay of the exponential backoff between executor retries.
    pub executor_backoff_base: Duration,

    /// Whether a human with meeting notifications set to `None` still
    /// receives the coalesced batch copy in their inbox. Streamed copies
    /// are always suppressed for them.
    pub deliver_final_to_muted: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            agent_wait_timeout: Duration::from_secs(5),
            meeting_rolling_timeout: Duration::from_secs(1),
            meeting_max_batch_wait: Duration::from_secs(5),
            bus_close_grace: Duration::from_secs(5),
            artifact_threshold: 1024,
            inbox_capacity: None,
            executor_max_attempts: 3,
            executor_backoff_base: Duration::from_millis(500),
            deliver_final_to_muted: true,
        }
    }
}

/// Exit codes used by the process launcher hosting the runtime.
pub mod exit_code {
    /// Normal termination.
    pub const SUCCESS: i32 = 0;
    /// Error or uncaught failure.
    pub const ERROR: i32 = 1;
    /// A non-interactive run needed input that was never going to arrive.
    pub const NO_INPUT: i32 = 3;
}
