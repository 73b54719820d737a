//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use super::{
    ExpirySettings, MESSAGE_EXPIRATION_EVENT, StorageError, TimerStore, UpsertOutcome, missing_key,
};
use crate::core::timer::TimerRecord;
use crate::core::types::TimerId;

#[derive(Default)]
struct Timers {
    next_id: i64,
    rows: BTreeMap<TimerId, TimerRecord>,
}

impl Timers {
    fn insert(&mut self, timer: &TimerRecord) -> TimerId {
        self.next_id += 1;
        let id = TimerId::new(self.next_id);
        self.rows.insert(id, timer.clone().with_id(id));
        id
    }
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts. Ids are assigned from 1 upwards
/// and are never reused.
pub struct InMemoryStore {
    timers: RwLock<Timers>,
    channel_expiry: RwLock<HashMap<u64, Duration>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            timers: RwLock::new(Timers::default()),
            channel_expiry: RwLock::new(HashMap::new()),
        }
    }

    /// Number of pending timers.
    pub fn len(&self) -> Result<usize, StorageError> {
        let timers = self.timers.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(timers.rows.len())
    }

    /// Whether no timers are pending.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimerStore for InMemoryStore {
    async fn create(&self, timer: &TimerRecord) -> Result<TimerId, StorageError> {
        let mut timers = self.timers.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(key) = timer.key.as_deref() {
            if timers.rows.values().any(|t| t.key.as_deref() == Some(key)) {
                return Err(StorageError::DuplicateKey(format!("timer key: {}", key)));
            }
        }
        Ok(timers.insert(timer))
    }

    async fn delete(&self, id: TimerId) -> Result<(), StorageError> {
        let mut timers = self.timers.write().map_err(|_| StorageError::LockPoisoned)?;
        timers.rows.remove(&id);
        Ok(())
    }

    async fn get_earliest(&self) -> Result<Option<TimerRecord>, StorageError> {
        let timers = self.timers.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(timers
            .rows
            .iter()
            .min_by_key(|(id, timer)| (timer.expires, **id))
            .map(|(_, timer)| timer.clone()))
    }

    async fn create_or_update(&self, timer: &TimerRecord) -> Result<UpsertOutcome, StorageError> {
        let key = timer.key.as_deref().ok_or_else(|| missing_key(timer))?;
        let mut timers = self.timers.write().map_err(|_| StorageError::LockPoisoned)?;

        let existing = timers
            .rows
            .values()
            .find(|t| t.key.as_deref() == Some(key))
            .cloned();

        match existing {
            None => Ok(UpsertOutcome::Created(timers.insert(timer))),
            Some(existing) if timer.expires < existing.expires => {
                let previous = existing
                    .id
                    .ok_or_else(|| StorageError::Other("stored timer has no id".to_string()))?;
                timers.rows.remove(&previous);
                let id = timers.insert(timer);
                Ok(UpsertOutcome::Replaced { id, previous })
            }
            Some(existing) => Ok(UpsertOutcome::Kept(existing)),
        }
    }

    async fn get(&self, id: TimerId) -> Result<Option<TimerRecord>, StorageError> {
        let timers = self.timers.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(timers.rows.get(&id).cloned())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<TimerRecord>, StorageError> {
        let timers = self.timers.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = timers.rows.values().cloned().collect();
        result.sort_by_key(|t| (t.expires, t.id));
        result.truncate(limit);
        Ok(result)
    }
}

#[async_trait]
impl ExpirySettings for InMemoryStore {
    async fn channel_expiry(&self, channel_id: u64) -> Result<Option<Duration>, StorageError> {
        let expiry = self
            .channel_expiry
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(expiry.get(&channel_id).copied())
    }

    async fn set_channel_expiry(
        &self,
        channel_id: u64,
        expiry: Duration,
    ) -> Result<(), StorageError> {
        let mut settings = self
            .channel_expiry
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        settings.insert(channel_id, expiry);
        Ok(())
    }

    async fn clear_channel_expiry(&self, channel_id: u64) -> Result<(), StorageError> {
        let mut settings = self
            .channel_expiry
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        settings.remove(&channel_id);
        Ok(())
    }

    async fn message_expiration(
        &self,
        message_id: u64,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let timers = self.timers.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(timers
            .rows
            .values()
            .filter(|t| t.event == MESSAGE_EXPIRATION_EVENT)
            .filter(|t| t.payload.kwarg::<u64>("message_id").ok() == Some(message_id))
            .map(|t| t.expires)
            .min())
    }
}
