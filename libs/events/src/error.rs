//! Error types for the event bus.

use thiserror::Error;

/// Errors returned by [`crate::EventBus`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The dispatch loop has shut down; the event was not queued.
    #[error("event bus is closed")]
    Closed,

    /// `start` was called on a bus whose loop is already running.
    #[error("event bus already started")]
    AlreadyStarted,
}
