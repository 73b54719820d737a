//! Core timer types: identifiers, records, payloads, clocks and durations.

pub mod clock;
pub mod duration;
pub mod timer;
pub mod types;
