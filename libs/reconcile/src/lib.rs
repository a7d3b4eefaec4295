//! Reconciliation primitives.
//!
//! The building blocks a per-machine controller uses to converge the
//! observed lifecycle state toward the desired one:
//!
//! - **Lifecycle**: [`MachineState`], [`DesiredState`] and the
//!   compatibility predicate [`matches`].
//! - **Health debounce**: [`HealthCounter`] turns a stream of healthcheck
//!   outcomes into `Healthy`/`Degraded`/`Failed` verdicts.
//! - **Single-flight tasks**: [`TaskSlot`] runs at most one cancellable
//!   background task per slot, keyed by its target.
//! - **Backoff**: [`BackoffPolicy`] for reconnect loops.
//!
//! # Invariants
//!
//! - `Terminated` is terminal: no state is reachable from it.
//! - Two tasks of one slot never run at the same time; a superseding task
//!   starts only after its predecessor has returned.

mod backoff;
mod health;
mod state;
mod task;

pub use backoff::BackoffPolicy;
pub use health::{HealthCounter, HealthVerdict, FAILURE_THRESHOLD};
pub use state::{matches, DesiredState, MachineState};
pub use task::{StartOutcome, TaskSlot};

use thiserror::Error;

/// Errors from parsing persisted lifecycle values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Unrecognized state name.
    #[error("unknown machine state: {0}")]
    UnknownState(String),

    /// Unrecognized desired-state name.
    #[error("unknown desired state: {0}")]
    UnknownDesiredState(String),
}
