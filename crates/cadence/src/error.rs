//! Error types for the driver.

use std::fmt;

use thiserror::Error;

/// Stable classification of work and hook failures.
///
/// The driver never inspects failure payloads; it matches a failure's kind
/// against the driver's retryable set to decide between backoff-and-continue
/// and propagation. [`FailureKind::External`] is the escape hatch for
/// host-defined transient conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// I/O failure (sockets, files, pipes).
    Io,
    /// Operation timed out.
    Timeout,
    /// An established connection was lost.
    ConnectionLost,
    /// Peer violated the expected protocol.
    Protocol,
    /// Remote side asked us to slow down.
    RateLimited,
    /// Host-defined category.
    External(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => f.write_str("io"),
            Self::Timeout => f.write_str("timeout"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::Protocol => f.write_str("protocol"),
            Self::RateLimited => f.write_str("rate limited"),
            Self::External(tag) => write!(f, "external:{tag}"),
        }
    }
}

/// A failure reported by the unit of work or a lifecycle hook.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct WorkError {
    kind: FailureKind,
    message: String,
}

impl WorkError {
    /// Create a new work error with the given classification.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The failure's category.
    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    /// Human-readable detail.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Which lifecycle hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// The setup hook, invoked once before the first iteration.
    Before,
    /// The teardown hook, invoked once after the loop ends.
    After,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => f.write_str("before"),
            Self::After => f.write_str("after"),
        }
    }
}

/// Errors surfaced by driver construction, start, or the running loop.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Invalid construction or registration arguments.
    #[error("invalid driver configuration: {0}")]
    Configuration(String),

    /// A run is already in flight for this driver.
    #[error("driver is already running")]
    AlreadyRunning,

    /// The work failed with a non-retryable failure, or retry is disabled.
    #[error("task failed: {0}")]
    Fatal(#[source] WorkError),

    /// A lifecycle hook failed.
    #[error("{hook} hook failed: {source}")]
    Hook {
        /// Which hook failed.
        hook: HookKind,
        /// The failure the hook reported.
        #[source]
        source: WorkError,
    },
}
