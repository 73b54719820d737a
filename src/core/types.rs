//! Core identifier types for the dispatcher.
//!
//! Timers receive their identifier from the backing store when they are
//! persisted; unpersisted timers have none.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned identifier of a persisted timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(i64);

impl TimerId {
    /// Create a TimerId from a raw store key.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the underlying store key.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for TimerId {
    fn from(id: i64) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
