//! Disappearing messages built on the dispatcher.
//!
//! A channel may carry an expiry duration. Every message posted there gets
//! a `message_expiration` timer at `created_at + expiry`, whose payload
//! names the channel and message to remove.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::timer::{PayloadError, TimerPayload, TimerRecord};
use crate::dispatcher::{DispatcherError, DispatcherHandle};
use crate::storage::{
    ExpirySettings, MESSAGE_EXPIRATION_EVENT, StorageError, TimerStore, UpsertOutcome,
};

/// Errors raised while managing message expiry.
#[derive(Debug, Error)]
pub enum ExpiryError {
    /// Scheduling the expiration timer failed.
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    /// Reading the channel settings failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The expiry cannot be added to a timestamp.
    #[error("expiry out of range: {0:?}")]
    OutOfRange(Duration),
}

impl From<PayloadError> for ExpiryError {
    fn from(err: PayloadError) -> Self {
        ExpiryError::Dispatcher(DispatcherError::Payload(err))
    }
}

/// Named arguments of a `message_expiration` timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationTarget {
    /// Channel holding the message.
    pub channel_id: u64,
    /// Message to remove.
    pub message_id: u64,
}

impl ExpirationTarget {
    /// Decode the target from a fired timer.
    pub fn from_timer(timer: &TimerRecord) -> Result<Self, PayloadError> {
        Ok(Self {
            channel_id: timer.payload.kwarg("channel_id")?,
            message_id: timer.payload.kwarg("message_id")?,
        })
    }

    fn payload(&self) -> Result<TimerPayload, PayloadError> {
        TimerPayload::new().with_kwargs(self)
    }

    fn key(&self) -> String {
        format!("{}:{}", self.channel_id, self.message_id)
    }
}

/// Schedules message expiration timers from per-channel settings.
pub struct MessageExpiry<S: TimerStore + ExpirySettings> {
    dispatcher: DispatcherHandle<S>,
}

impl<S: TimerStore + ExpirySettings + 'static> MessageExpiry<S> {
    /// Create an expiry manager on top of a running dispatcher.
    pub fn new(dispatcher: DispatcherHandle<S>) -> Self {
        Self { dispatcher }
    }

    /// Set or replace the expiry of a channel.
    pub async fn set_channel_expiry(
        &self,
        channel_id: u64,
        expiry: Duration,
    ) -> Result<(), ExpiryError> {
        chrono::Duration::from_std(expiry).map_err(|_| ExpiryError::OutOfRange(expiry))?;
        self.dispatcher
            .store()
            .set_channel_expiry(channel_id, expiry)
            .await?;
        tracing::info!(channel_id, expiry = ?expiry, "Channel expiry set");
        Ok(())
    }

    /// Stop expiring new messages in a channel. Pending timers still fire.
    pub async fn clear_channel_expiry(&self, channel_id: u64) -> Result<(), ExpiryError> {
        self.dispatcher
            .store()
            .clear_channel_expiry(channel_id)
            .await?;
        tracing::info!(channel_id, "Channel expiry cleared");
        Ok(())
    }

    /// Schedule expiration of a newly posted message.
    ///
    /// The timer is keyed by channel and message and always persisted, so
    /// [`keep_until`](Self::keep_until) and [`expires_at`](Self::expires_at)
    /// see it. If the message already has a sooner expiration, that one is
    /// kept and returned. Returns `None` when the channel has no expiry.
    pub async fn on_message(
        &self,
        channel_id: u64,
        message_id: u64,
        created_at: DateTime<Utc>,
    ) -> Result<Option<TimerRecord>, ExpiryError> {
        let Some(expiry) = self.dispatcher.store().channel_expiry(channel_id).await? else {
            return Ok(None);
        };
        let offset =
            chrono::Duration::from_std(expiry).map_err(|_| ExpiryError::OutOfRange(expiry))?;
        let expires = created_at
            .checked_add_signed(offset)
            .ok_or(ExpiryError::OutOfRange(expiry))?;

        let target = ExpirationTarget {
            channel_id,
            message_id,
        };
        let timer =
            TimerRecord::new(MESSAGE_EXPIRATION_EVENT, created_at, expires, target.payload()?)
                .with_key(target.key());
        let timer = match self.dispatcher.schedule_keyed_record(timer.clone()).await? {
            UpsertOutcome::Created(id) | UpsertOutcome::Replaced { id, .. } => timer.with_id(id),
            UpsertOutcome::Kept(existing) => existing,
        };
        Ok(Some(timer))
    }

    /// Make sure a message expires no later than `when`.
    ///
    /// An already pending expiration is only ever moved earlier.
    pub async fn keep_until(
        &self,
        channel_id: u64,
        message_id: u64,
        when: DateTime<Utc>,
    ) -> Result<UpsertOutcome, ExpiryError> {
        let target = ExpirationTarget {
            channel_id,
            message_id,
        };
        let outcome = self
            .dispatcher
            .schedule_keyed(target.key(), MESSAGE_EXPIRATION_EVENT, when, target.payload()?)
            .await?;
        Ok(outcome)
    }

    /// When a message is due to expire, if it has a pending timer.
    pub async fn expires_at(&self, message_id: u64) -> Result<Option<DateTime<Utc>>, ExpiryError> {
        Ok(self.dispatcher.store().message_expiration(message_id).await?)
    }
}
