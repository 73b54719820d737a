//! Storage abstraction for persisting timers.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite). The store is the single source
//! of truth for pending timers: backends never cache, every call goes to
//! the backing store.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::core::timer::TimerRecord;
use crate::core::types::TimerId;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store could not be reached (network error, closed
    /// connection, exhausted or closed pool). Transient.
    #[error("storage connection error: {0}")]
    Connection(String),

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether the failure is a connectivity problem worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }
}

/// Result of a keyed create-or-update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No timer had the key; a new one was inserted.
    Created(TimerId),
    /// A later timer with the key was deleted and the sooner one inserted.
    Replaced {
        /// Id of the inserted timer.
        id: TimerId,
        /// Id of the deleted timer.
        previous: TimerId,
    },
    /// An existing timer with the key fires no later; nothing changed.
    Kept(TimerRecord),
}

/// Durable CRUD over timer records.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Insert a timer and return its store-assigned id.
    ///
    /// Any `id` already set on the record is ignored.
    async fn create(&self, timer: &TimerRecord) -> Result<TimerId, StorageError>;

    /// Delete a timer. Deleting an absent timer is not an error.
    async fn delete(&self, id: TimerId) -> Result<(), StorageError>;

    /// The timer with the earliest `expires`, ties broken by id.
    async fn get_earliest(&self) -> Result<Option<TimerRecord>, StorageError>;

    /// Insert a keyed timer, or replace the existing timer with the same key
    /// when the new deadline is strictly sooner.
    ///
    /// Fails with [`StorageError::Other`] when the record has no key.
    async fn create_or_update(&self, timer: &TimerRecord) -> Result<UpsertOutcome, StorageError>;

    /// Get a timer by id.
    async fn get(&self, id: TimerId) -> Result<Option<TimerRecord>, StorageError>;

    /// List up to `limit` pending timers, earliest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<TimerRecord>, StorageError>;
}

/// Per-channel expiry settings and message-expiration lookups.
///
/// These back the "disappearing messages" use of the dispatcher: a channel
/// carries an expiry duration, and every message sent there gets a
/// `message_expiration` timer.
#[async_trait]
pub trait ExpirySettings: Send + Sync {
    /// Expiry configured for a channel, if any.
    async fn channel_expiry(&self, channel_id: u64) -> Result<Option<Duration>, StorageError>;

    /// Set or replace the expiry for a channel.
    async fn set_channel_expiry(&self, channel_id: u64, expiry: Duration)
    -> Result<(), StorageError>;

    /// Remove the expiry for a channel. Clearing an unset channel is a no-op.
    async fn clear_channel_expiry(&self, channel_id: u64) -> Result<(), StorageError>;

    /// Deadline of the earliest pending expiration timer for a message.
    async fn message_expiration(
        &self,
        message_id: u64,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;
}

/// Event name used for message expiration timers.
pub const MESSAGE_EXPIRATION_EVENT: &str = "message_expiration";

fn missing_key(timer: &TimerRecord) -> StorageError {
    StorageError::Other(format!(
        "create_or_update requires a key (event: {})",
        timer.event
    ))
}
