//! Timer dispatcher.
//!
//! This module provides the dispatch loop that keeps exactly one timer
//! armed at a time, fires it when its deadline passes and recovers from
//! lost storage connections.

mod engine;
mod handle;
mod types;

pub use engine::{DEFAULT_FAST_PATH_THRESHOLD, Dispatcher};
pub use handle::DispatcherHandle;
pub use types::{DispatcherError, DispatcherState};
