//! Testing utilities for users of the chrona library.
//!
//! This module provides helpers for testing timer dispatch:
//!
//! - [`RecordingSink`]: An event sink that records every fired timer
//! - [`FlakyStore`]: A store wrapper that injects connection failures
//! - [`VirtualClock`]: A clock that follows tokio's (pausable) time

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};

use crate::core::clock::{Clock, SystemClock};
use crate::core::timer::TimerRecord;
use crate::core::types::TimerId;
use crate::events::EventSink;
use crate::storage::{StorageError, TimerStore, UpsertOutcome};

/// A timer delivered to a [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct FiredTimer {
    /// The delivered record.
    pub timer: TimerRecord,
    /// Clock time at delivery.
    pub fired_at: DateTime<Utc>,
}

/// An event sink that records every timer it receives, in delivery order.
///
/// # Example
///
/// ```
/// use chrona::events::EventSink;
/// use chrona::testing::RecordingSink;
/// use chrona::{TimerPayload, TimerRecord};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let sink = RecordingSink::new();
/// let now = chrono::Utc::now();
/// sink.dispatch(&TimerRecord::new("reminder", now, now, TimerPayload::new())).await;
/// assert_eq!(sink.events().await, vec!["reminder"]);
/// # });
/// ```
pub struct RecordingSink {
    clock: Arc<dyn Clock>,
    fired: Mutex<Vec<FiredTimer>>,
    count: watch::Sender<usize>,
}

impl RecordingSink {
    /// Create a sink that timestamps deliveries with the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a sink that timestamps deliveries with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            clock,
            fired: Mutex::new(Vec::new()),
            count,
        }
    }

    /// All deliveries so far.
    pub async fn records(&self) -> Vec<FiredTimer> {
        self.fired.lock().await.clone()
    }

    /// Event names of all deliveries so far.
    pub async fn events(&self) -> Vec<String> {
        self.fired
            .lock()
            .await
            .iter()
            .map(|f| f.timer.event.clone())
            .collect()
    }

    /// Number of deliveries so far.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until at least `n` timers were delivered.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn dispatch(&self, timer: &TimerRecord) {
        let mut fired = self.fired.lock().await;
        fired.push(FiredTimer {
            timer: timer.clone(),
            fired_at: self.clock.now(),
        });
        self.count.send_replace(fired.len());
    }
}

/// A store wrapper that can be configured to fail specific operations.
///
/// Wraps any [`TimerStore`] and selectively returns errors, simulating a
/// database that drops connections.
pub struct FlakyStore<S> {
    inner: S,
    get_earliest_failures: AtomicU32,
    create_failures: AtomicU32,
    delete_failures: AtomicU32,
    fatal: AtomicBool,
    injected: AtomicU32,
}

impl<S: TimerStore> FlakyStore<S> {
    /// Wrap a store; no failures are injected until configured.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            get_earliest_failures: AtomicU32::new(0),
            create_failures: AtomicU32::new(0),
            delete_failures: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
            injected: AtomicU32::new(0),
        }
    }

    /// Fail the next `times` calls to `get_earliest` with a connection error.
    pub fn fail_get_earliest(&self, times: u32) {
        self.get_earliest_failures.store(times, Ordering::SeqCst);
    }

    /// Fail every `get_earliest` call with a non-transient error.
    pub fn fail_get_earliest_fatally(&self) {
        self.fatal.store(true, Ordering::SeqCst);
    }

    /// Fail the next `times` calls to `create` with a connection error.
    pub fn fail_create(&self, times: u32) {
        self.create_failures.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` calls to `delete` with a connection error.
    pub fn fail_delete(&self, times: u32) {
        self.delete_failures.store(times, Ordering::SeqCst);
    }

    /// Number of errors injected so far.
    pub fn injected_failures(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn take_failure(&self, counter: &AtomicU32, operation: &str) -> Result<(), StorageError> {
        let failed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Connection(format!(
                "injected {} connection loss",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: TimerStore> TimerStore for FlakyStore<S> {
    async fn create(&self, timer: &TimerRecord) -> Result<TimerId, StorageError> {
        self.take_failure(&self.create_failures, "create")?;
        self.inner.create(timer).await
    }

    async fn delete(&self, id: TimerId) -> Result<(), StorageError> {
        self.take_failure(&self.delete_failures, "delete")?;
        self.inner.delete(id).await
    }

    async fn get_earliest(&self) -> Result<Option<TimerRecord>, StorageError> {
        if self.fatal.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Other("injected get_earliest error".into()));
        }
        self.take_failure(&self.get_earliest_failures, "get_earliest")?;
        self.inner.get_earliest().await
    }

    async fn create_or_update(&self, timer: &TimerRecord) -> Result<UpsertOutcome, StorageError> {
        self.inner.create_or_update(timer).await
    }

    async fn get(&self, id: TimerId) -> Result<Option<TimerRecord>, StorageError> {
        self.inner.get(id).await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<TimerRecord>, StorageError> {
        self.inner.list_pending(limit).await
    }
}

/// A clock whose "now" advances with tokio's timer.
///
/// Under `#[tokio::test(start_paused = true)]` tokio time jumps forward
/// whenever every task is idle, so waits of days finish instantly while
/// `now()` still reports the matching wall-clock instant.
pub struct VirtualClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl VirtualClock {
    /// Start the clock at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start the clock at `base`.
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default();
        self.base + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
