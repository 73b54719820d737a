//! Dispatch ordering integration tests.
//!
//! Tests that timers fire in deadline order, that sooner timers preempt
//! the armed one, and that payloads arrive untouched.

use crate::common::{Harness, LONG_WAIT, wait_for_pending};
use chrona::{Clock, DispatcherState, InMemoryStore, TimerPayload, TimerStore};
use chrono::Duration;
use std::sync::Arc;

/// Test: Timers with distinct deadlines fire in non-decreasing order.
#[tokio::test(start_paused = true)]
async fn test_timers_fire_in_deadline_order() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));
    let now = h.clock.now();

    let offsets = [3600, 45, 86_400, 600, 7, 120];
    for (i, secs) in offsets.iter().enumerate() {
        h.handle
            .schedule(
                format!("t{}", i),
                now + Duration::seconds(*secs),
                TimerPayload::new(),
            )
            .await
            .unwrap();
    }

    assert!(h.sink.wait_for_count(offsets.len(), LONG_WAIT).await);
    let fired = h.sink.records().await;
    assert!(
        fired
            .windows(2)
            .all(|w| w[0].timer.expires <= w[1].timer.expires)
    );
    for record in &fired {
        assert!(record.fired_at >= record.timer.expires);
    }
    h.stop().await;
}

/// Test: A timer at T+5s scheduled while T+60s is armed fires first.
#[tokio::test(start_paused = true)]
async fn test_sooner_timer_fires_first() {
    let h = Harness::start_with(Arc::new(InMemoryStore::new()), |d| {
        d.with_fast_path_threshold(std::time::Duration::ZERO)
    });
    let start = h.clock.now();

    h.handle
        .schedule("sixty", start + Duration::seconds(60), TimerPayload::new())
        .await
        .unwrap();
    h.handle.wait_for_state(DispatcherState::Armed).await;
    h.handle
        .schedule("five", start + Duration::seconds(5), TimerPayload::new())
        .await
        .unwrap();

    assert!(h.sink.wait_for_count(2, LONG_WAIT).await);
    assert_eq!(h.sink.events().await, vec!["five", "sixty"]);
    let fired = h.sink.records().await;
    assert!(fired[0].fired_at < start + Duration::seconds(60));
    h.stop().await;
}

/// Test: The same scenario with the default fast path still fires T+5s first.
#[tokio::test(start_paused = true)]
async fn test_sooner_fast_path_timer_fires_first() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));
    let start = h.clock.now();

    h.handle
        .schedule("sixty", start + Duration::seconds(60), TimerPayload::new())
        .await
        .unwrap();
    h.handle.wait_for_state(DispatcherState::Armed).await;
    let five = h
        .handle
        .schedule("five", start + Duration::seconds(5), TimerPayload::new())
        .await
        .unwrap();

    assert!(five.id.is_none());
    assert!(h.sink.wait_for_count(2, LONG_WAIT).await);
    assert_eq!(h.sink.events().await, vec!["five", "sixty"]);
    h.stop().await;
}

/// Test: A 2s timer fires without ever being visible in the store.
#[tokio::test(start_paused = true)]
async fn test_fast_path_timer_is_never_stored() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));

    let timer = h
        .handle
        .schedule("blink", h.clock.now() + Duration::seconds(2), TimerPayload::new())
        .await
        .unwrap();
    assert!(h.store.get_earliest().await.unwrap().is_none());

    assert!(h.sink.wait_for_count(1, LONG_WAIT).await);
    assert_eq!(h.sink.records().await[0].timer, timer);
    assert!(h.store.get_earliest().await.unwrap().is_none());
    h.stop().await;
}

/// Test: Payload {args: [1, "a"], kwargs: {"x": true}} arrives unchanged.
#[tokio::test(start_paused = true)]
async fn test_payload_is_delivered_unchanged() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));
    let payload = TimerPayload::new()
        .with_arg(1)
        .unwrap()
        .with_arg("a")
        .unwrap()
        .with_kwarg("x", true)
        .unwrap();

    h.handle
        .schedule("reminder", h.clock.now() + Duration::seconds(1), payload.clone())
        .await
        .unwrap();

    assert!(h.sink.wait_for_count(1, LONG_WAIT).await);
    let delivered = &h.sink.records().await[0].timer;
    assert_eq!(delivered.payload, payload);
    assert_eq!(delivered.payload.arg::<i64>(0).unwrap(), 1);
    assert_eq!(delivered.payload.arg::<String>(1).unwrap(), "a");
    assert!(delivered.payload.kwarg::<bool>("x").unwrap());
    h.stop().await;
}

/// Test: A persisted payload survives the store round trip.
#[tokio::test(start_paused = true)]
async fn test_persisted_payload_is_delivered_unchanged() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));
    let payload = TimerPayload::new()
        .with_arg(1)
        .unwrap()
        .with_arg("a")
        .unwrap()
        .with_kwarg("x", true)
        .unwrap();

    let timer = h
        .handle
        .schedule("reminder", h.clock.now() + Duration::hours(1), payload.clone())
        .await
        .unwrap();

    assert!(timer.is_persisted());
    assert!(h.sink.wait_for_count(1, LONG_WAIT).await);
    assert_eq!(h.sink.records().await[0].timer.payload, payload);
    h.stop().await;
}

/// Test: Deleting a timer twice is harmless and leaves others alone.
#[tokio::test(start_paused = true)]
async fn test_double_delete_does_not_affect_other_timers() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));
    let now = h.clock.now();

    h.handle
        .schedule("kept", now + Duration::minutes(10), TimerPayload::new())
        .await
        .unwrap();
    let doomed = h
        .handle
        .schedule("doomed", now + Duration::minutes(20), TimerPayload::new())
        .await
        .unwrap();

    let id = doomed.id.unwrap();
    h.store.delete(id).await.unwrap();
    h.store.delete(id).await.unwrap();
    wait_for_pending(h.store.as_ref(), 1, LONG_WAIT).await;

    assert!(h.sink.wait_for_count(1, LONG_WAIT).await);
    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;

    assert_eq!(h.sink.events().await, vec!["kept"]);
    assert!(h.store.get_earliest().await.unwrap().is_none());
    h.stop().await;
}

/// Test: Many concurrent schedulers all get their timers fired exactly once.
#[tokio::test(start_paused = true)]
async fn test_concurrent_schedules_fire_once_each() {
    let h = Harness::start(Arc::new(InMemoryStore::new()));
    let now = h.clock.now();

    let mut joins = Vec::new();
    for i in 0..20i64 {
        let handle = h.handle.clone();
        joins.push(tokio::spawn(async move {
            handle
                .schedule(
                    format!("t{}", i),
                    now + Duration::seconds(30 + (i * 37) % 200),
                    TimerPayload::new(),
                )
                .await
                .unwrap()
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    assert!(h.sink.wait_for_count(20, LONG_WAIT).await);
    let mut events = h.sink.events().await;
    events.sort();
    events.dedup();
    assert_eq!(events.len(), 20);
    assert!(h.store.get_earliest().await.unwrap().is_none());
    h.stop().await;
}
