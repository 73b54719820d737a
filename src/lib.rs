//! chrona - a durable single-active-timer dispatcher.
//!
//! Timers ("fire event E at time T with payload P") are persisted to a
//! [`TimerStore`]. A background loop arms the earliest one, sleeps until it
//! is due, deletes it and hands it to an [`EventSink`]. Scheduling a sooner
//! timer preempts the sleep; lost storage connections restart the loop.

pub mod config;
pub mod core;
pub mod dispatcher;
pub mod events;
pub mod expiry;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, DispatcherConfig, StorageConfig, YamlLoader};
pub use core::clock::{Clock, MAX_SLEEP, SystemClock};
pub use core::duration::{DurationError, format_duration, natural_delta, parse_duration};
pub use core::timer::{PayloadError, TimerPayload, TimerRecord};
pub use core::types::TimerId;
pub use dispatcher::{Dispatcher, DispatcherError, DispatcherHandle, DispatcherState};
pub use events::{EventRouter, EventSink, HandlerError, TimerHandler};
pub use expiry::{ExpirationTarget, ExpiryError, MessageExpiry};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use storage::{ExpirySettings, InMemoryStore, StorageError, TimerStore, UpsertOutcome};
