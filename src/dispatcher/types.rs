//! Dispatcher type definitions.
//!
//! This module contains the error type and the observable state enum.

use thiserror::Error;

use crate::core::timer::PayloadError;
use crate::storage::StorageError;

/// Errors that can occur in the dispatcher.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The timer payload could not be built.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Event names must be non-empty.
    #[error("invalid event name: {0:?}")]
    InvalidEvent(String),

    /// Keyed scheduling was requested without a key.
    #[error("keyed scheduling requires a non-empty key")]
    MissingKey,
}

impl DispatcherError {
    /// Whether the dispatch loop should restart rather than stop.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatcherError::Storage(e) if e.is_transient())
    }
}

/// State of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// No pending timer; waiting for one to be scheduled.
    Idle,
    /// Sleeping until the current timer's deadline.
    Armed,
    /// Deleting the current timer and notifying the sink.
    Firing,
    /// Recovering from a lost storage connection.
    Restarting,
    /// The loop has exited.
    Stopped,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Armed => "armed",
            DispatcherState::Firing => "firing",
            DispatcherState::Restarting => "restarting",
            DispatcherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
