//! Dispatcher handle for scheduling timers.
//!
//! This module provides the `DispatcherHandle` type, the entry point for
//! scheduling timers and for observing or stopping the dispatch loop.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::clock::sleep_until;
use crate::core::timer::{TimerPayload, TimerRecord};
use crate::storage::{TimerStore, UpsertOutcome};

use super::engine::Shared;
use super::types::{DispatcherError, DispatcherState};

/// Handle for scheduling timers on a running dispatcher.
///
/// Cheap to clone; all clones drive the same loop.
pub struct DispatcherHandle<S: TimerStore> {
    shared: Arc<Shared<S>>,
}

impl<S: TimerStore> Clone for DispatcherHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: TimerStore + 'static> DispatcherHandle<S> {
    pub(super) fn new(shared: Arc<Shared<S>>) -> Self {
        Self { shared }
    }

    /// Schedule `event` to fire at `when` with `payload`.
    ///
    /// Returns the record before it fires. Deadlines within the fast-path
    /// window are kept in memory only and the returned record has no id.
    pub async fn schedule(
        &self,
        event: impl Into<String>,
        when: DateTime<Utc>,
        payload: TimerPayload,
    ) -> Result<TimerRecord, DispatcherError> {
        let now = self.shared.clock.now();
        self.schedule_record(TimerRecord::new(event, now, when, payload))
            .await
    }

    /// Schedule a prepared record, keeping its `created_at`.
    ///
    /// Any id or key on the record is ignored.
    pub async fn schedule_record(
        &self,
        mut timer: TimerRecord,
    ) -> Result<TimerRecord, DispatcherError> {
        validate_event(&timer.event)?;
        timer.key = None;
        timer.id = None;

        let delta = timer.expires - self.shared.clock.now();
        let within_fast_path = delta
            .to_std()
            .map(|ahead| ahead <= self.shared.fast_path_threshold)
            .unwrap_or(true);

        // After shutdown nothing would fire the in-memory copy; persist it
        // so the next run picks it up.
        if within_fast_path && !self.shared.shutdown.is_cancelled() {
            self.spawn_fast_path(timer.clone());
            return Ok(timer);
        }

        let id = self.shared.store.create(&timer).await?;
        let timer = timer.with_id(id);
        tracing::debug!(
            timer_id = %id,
            event = %timer.event,
            expires = %timer.expires,
            "Timer scheduled"
        );

        self.notify_scheduled(&timer).await;
        Ok(timer)
    }

    /// Schedule a timer de-duplicated by `key`.
    ///
    /// If a timer with the same key is pending, its deadline only ever moves
    /// earlier: a later `when` keeps the existing timer. Keyed timers are
    /// always persisted.
    pub async fn schedule_keyed(
        &self,
        key: impl Into<String>,
        event: impl Into<String>,
        when: DateTime<Utc>,
        payload: TimerPayload,
    ) -> Result<UpsertOutcome, DispatcherError> {
        let timer =
            TimerRecord::new(event, self.shared.clock.now(), when, payload).with_key(key);
        self.schedule_keyed_record(timer).await
    }

    /// Schedule a prepared keyed record, keeping its `created_at`.
    ///
    /// Follows the same rules as [`schedule_keyed`](Self::schedule_keyed).
    /// Any id on the record is ignored.
    pub async fn schedule_keyed_record(
        &self,
        mut timer: TimerRecord,
    ) -> Result<UpsertOutcome, DispatcherError> {
        if timer.key.as_deref().is_none_or(str::is_empty) {
            return Err(DispatcherError::MissingKey);
        }
        validate_event(&timer.event)?;
        timer.id = None;

        let outcome = self.shared.store.create_or_update(&timer).await?;
        match &outcome {
            UpsertOutcome::Created(id) => {
                tracing::debug!(timer_id = %id, event = %timer.event, "Keyed timer created");
                self.notify_scheduled(&timer.clone().with_id(*id)).await;
            }
            UpsertOutcome::Replaced { id, previous } => {
                tracing::debug!(
                    timer_id = %id,
                    previous = %previous,
                    event = %timer.event,
                    "Keyed timer moved earlier"
                );
                self.notify_scheduled(&timer.clone().with_id(*id)).await;
            }
            UpsertOutcome::Kept(existing) => {
                tracing::debug!(
                    timer_id = ?existing.id,
                    event = %existing.event,
                    "Keyed timer kept"
                );
            }
        }
        Ok(outcome)
    }

    /// Wake the loop and preempt it when `timer` is due before the armed one.
    async fn notify_scheduled(&self, timer: &TimerRecord) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.raise_signal();

        if inner.phase == DispatcherState::Firing {
            return;
        }
        let sooner = inner
            .current
            .as_ref()
            .is_some_and(|current| timer.expires < current.expires);
        if sooner {
            tracing::debug!(timer_id = ?timer.id, "Preempting armed timer");
            inner.current = Some(timer.clone());
            inner.iteration.cancel();
        }
    }

    fn spawn_fast_path(&self, timer: TimerRecord) {
        let clock = Arc::clone(&self.shared.clock);
        let sink = Arc::clone(&self.shared.sink);
        let shutdown = self.shared.shutdown.clone();
        tracing::debug!(
            event = %timer.event,
            expires = %timer.expires,
            "Short timer kept in memory"
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(event = %timer.event, "Short timer dropped on shutdown");
                }
                _ = sleep_until(clock.as_ref(), timer.expires) => {
                    sink.dispatch(&timer).await;
                }
            }
        });
    }

    /// Stop the dispatch loop. Pending timers stay in the store.
    pub fn shutdown(&self) {
        tracing::info!("Timer dispatcher shutting down");
        self.shared.shutdown.cancel();
    }

    /// Get the current dispatcher state.
    pub fn state(&self) -> DispatcherState {
        *self.shared.state_tx.borrow()
    }

    /// Check if the loop is still running.
    pub fn is_running(&self) -> bool {
        self.state() != DispatcherState::Stopped
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the loop reaches `state` (or has stopped).
    pub async fn wait_for_state(&self, state: DispatcherState) -> DispatcherState {
        let mut rx = self.subscribe_state();
        match rx
            .wait_for(|s| *s == state || *s == DispatcherState::Stopped)
            .await
        {
            Ok(reached) => *reached,
            Err(_) => DispatcherState::Stopped,
        }
    }

    /// The timer the loop is currently sleeping on, if any.
    pub async fn current_timer(&self) -> Option<TimerRecord> {
        self.shared.inner.lock().await.current.clone()
    }

    /// The store backing this dispatcher.
    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Current time according to the dispatcher's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }
}

fn validate_event(event: &str) -> Result<(), DispatcherError> {
    if event.trim().is_empty() {
        return Err(DispatcherError::InvalidEvent(event.to_string()));
    }
    Ok(())
}
