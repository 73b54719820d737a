//! Recovery scenario integration tests.
//!
//! Tests that the dispatcher survives lost storage connections, stops on
//! fatal errors, and picks up pending timers after a restart.

use crate::common::{Harness, LONG_WAIT, wait_for_pending};
use chrona::testing::FlakyStore;
use chrona::{
    Clock, DispatcherError, DispatcherState, InMemoryStore, StorageError, TimerPayload,
    TimerRecord, TimerStore,
};
use chrono::Duration;
use std::sync::Arc;

/// Test: A connection lost while a timer is armed does not lose or repeat it.
#[tokio::test(start_paused = true)]
async fn test_connection_loss_while_armed() {
    let h = Harness::start_with(Arc::new(FlakyStore::new(InMemoryStore::new())), |d| {
        d.with_fast_path_threshold(std::time::Duration::ZERO)
    });
    let start = h.clock.now();

    h.handle
        .schedule("late", start + Duration::minutes(10), TimerPayload::new())
        .await
        .unwrap();
    h.handle.wait_for_state(DispatcherState::Armed).await;

    // The preemption forces a re-query, which hits the dead connection.
    h.store.fail_get_earliest(2);
    h.handle
        .schedule("soon", start + Duration::minutes(1), TimerPayload::new())
        .await
        .unwrap();

    assert!(h.sink.wait_for_count(2, LONG_WAIT).await);
    assert_eq!(h.sink.events().await, vec!["soon", "late"]);
    assert_eq!(h.store.injected_failures(), 2);
    assert!(h.handle.is_running());

    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    assert_eq!(h.sink.count(), 2);
    h.stop().await;
}

/// Test: A connection lost while deleting a matured timer fires it only once.
#[tokio::test(start_paused = true)]
async fn test_connection_loss_during_fire_does_not_refire() {
    let h = Harness::start(Arc::new(FlakyStore::new(InMemoryStore::new())));
    let start = h.clock.now();

    let timer = h
        .handle
        .schedule("once", start + Duration::minutes(10), TimerPayload::new())
        .await
        .unwrap();
    h.handle.wait_for_state(DispatcherState::Armed).await;
    h.store.fail_delete(1);

    assert!(h.sink.wait_for_count(1, LONG_WAIT).await);
    assert_eq!(h.sink.records().await[0].timer, timer);
    assert_eq!(h.store.injected_failures(), 1);

    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    assert_eq!(h.sink.count(), 1);
    assert!(h.store.inner().is_empty().unwrap());
    assert!(h.handle.is_running());
    h.stop().await;
}

/// Test: The loop comes back after the configured restart delay.
#[tokio::test(start_paused = true)]
async fn test_restart_delay_postpones_recovery() {
    let store = Arc::new(FlakyStore::new(InMemoryStore::new()));
    let now = chrono::Utc::now();
    store
        .inner()
        .create(&TimerRecord::new(
            "overdue",
            now - Duration::hours(1),
            now - Duration::minutes(1),
            TimerPayload::new(),
        ))
        .await
        .unwrap();
    store.fail_get_earliest(1);

    let h = Harness::start_with(Arc::clone(&store), |d| {
        d.with_restart_delay(std::time::Duration::from_secs(30))
    });
    let start = h.clock.now();

    assert_eq!(
        h.handle.wait_for_state(DispatcherState::Restarting).await,
        DispatcherState::Restarting
    );
    assert!(h.sink.wait_for_count(1, LONG_WAIT).await);

    let fired = h.sink.records().await;
    assert!(fired[0].fired_at >= start + Duration::seconds(30));
    assert!(store.inner().is_empty().unwrap());
    h.stop().await;
}

/// Test: Scheduling through a dead connection reports the error and keeps
/// the loop alive.
#[tokio::test(start_paused = true)]
async fn test_failed_schedule_is_reported() {
    let h = Harness::start(Arc::new(FlakyStore::new(InMemoryStore::new())));
    let now = h.clock.now();

    h.store.fail_create(1);
    let err = h
        .handle
        .schedule("lost", now + Duration::hours(1), TimerPayload::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());

    h.handle
        .schedule("kept", now + Duration::hours(2), TimerPayload::new())
        .await
        .unwrap();

    assert!(h.sink.wait_for_count(1, LONG_WAIT).await);
    assert_eq!(h.sink.events().await, vec!["kept"]);
    h.stop().await;
}

/// Test: A non-connection storage error ends the loop with that error.
#[tokio::test(start_paused = true)]
async fn test_fatal_error_stops_dispatcher() {
    let store = Arc::new(FlakyStore::new(InMemoryStore::new()));
    store.fail_get_earliest_fatally();
    let h = Harness::start(Arc::clone(&store));

    let result = h.task.await.unwrap();

    match result {
        Err(DispatcherError::Storage(StorageError::Other(_))) => {}
        other => panic!("expected fatal storage error, got {:?}", other),
    }
    assert_eq!(h.handle.state(), DispatcherState::Stopped);
    assert!(!h.handle.is_running());
}

/// Test: Timers left behind by a stopped dispatcher fire on the next run.
#[tokio::test(start_paused = true)]
async fn test_pending_timers_survive_restart() {
    let store = Arc::new(InMemoryStore::new());

    let first = Harness::start(Arc::clone(&store));
    let now = first.clock.now();
    for (event, minutes) in [("b", 20), ("a", 10)] {
        first
            .handle
            .schedule(event, now + Duration::minutes(minutes), TimerPayload::new())
            .await
            .unwrap();
    }
    first.handle.wait_for_state(DispatcherState::Armed).await;
    first.stop().await;
    assert_eq!(store.len().unwrap(), 2);

    let second = Harness::start(Arc::clone(&store));
    assert!(second.sink.wait_for_count(2, LONG_WAIT).await);
    assert_eq!(second.sink.events().await, vec!["a", "b"]);
    wait_for_pending(store.as_ref(), 0, LONG_WAIT).await;
    second.stop().await;
}

/// Test: Timers scheduled after shutdown are persisted, not fired.
#[tokio::test(start_paused = true)]
async fn test_schedule_after_shutdown_persists() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));
    h.handle.shutdown();

    let timer = h
        .handle
        .schedule("orphan", h.clock.now() + Duration::seconds(1), TimerPayload::new())
        .await
        .unwrap();

    assert!(timer.is_persisted());
    assert_eq!(h.store.get_earliest().await.unwrap(), Some(timer));
    h.task.await.unwrap().unwrap();
    assert_eq!(h.sink.count(), 0);
}
