//! Periodic task driver for tokio.
//!
//! This crate provides a cooperative background loop that:
//! - Runs an async unit of work on a fixed interval
//! - Survives transient failures with jittered exponential backoff
//! - Supports bounded or unbounded iteration counts
//! - Invokes setup/teardown hooks exactly once per run
//! - Cancels cooperatively, always running the teardown hook

mod backoff;
mod driver;
mod error;

pub use driver::{Driver, DriverBuilder, Hook, TaskFuture, TaskHandle, Work};
pub use error::{DriverError, FailureKind, HookKind, WorkError};
