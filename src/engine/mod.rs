// src/engine/mod.rs

//! Run outcome model and the caller-facing worker entry point.
//!
//! - [`ExecutionResult`] is the single terminal outcome of one run.
//! - [`TerminationSignal`] is the caller-owned, level-triggered cancellation
//!   observed by every supervising loop.
//! - [`worker`] wires the spec builder to whichever backend is active.

use std::time::Duration;

use thiserror::Error;

/// Cooperative cancellation shared by the caller and every supervising task.
///
/// Once cancelled it stays cancelled: every later `is_cancelled()` /
/// `cancelled().await` observes the fired state.
pub use tokio_util::sync::CancellationToken as TerminationSignal;

/// Why a run did not succeed.
///
/// One variant per failure class: spec construction, connection, creation,
/// runtime failures and timeout / external termination. Cleanup errors are
/// never represented here; they are logged once the result is decided.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    #[error("invalid unit spec: {0}")]
    InvalidSpec(String),

    #[error("cannot reach backend: {0}")]
    Connection(String),

    #[error("failed to create unit: {0}")]
    Creation(String),

    #[error("container {container} of unit {unit} exited with code {code}")]
    NonZeroExit {
        unit: String,
        container: String,
        code: i64,
    },

    #[error("watch on unit {unit} broke: {reason} (orphaned pod)")]
    WatchBroken { unit: String, reason: String },

    #[error("unit {unit} failed: {reason}")]
    UnitFailed { unit: String, reason: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("unit {unit} did not complete work within {after:?}")]
    TimedOut { unit: String, after: Duration },

    #[error("unit {unit} was signalled to terminate by the caller")]
    Terminated { unit: String },
}

impl RunFailure {
    /// True for the timeout / external termination class.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunFailure::TimedOut { .. } | RunFailure::Terminated { .. })
    }
}

/// Terminal outcome of a run: success, or a tagged failure.
pub type ExecutionResult = std::result::Result<(), RunFailure>;

pub mod worker;

pub use worker::Worker;
