//! Message expiry integration tests.
//!
//! Tests that channel expiry settings turn posted messages into
//! `message_expiration` timers that reach a registered handler.

use crate::common::LONG_WAIT;
use async_trait::async_trait;
use chrona::testing::VirtualClock;
use chrona::{
    Clock, Dispatcher, DispatcherHandle, EventRouter, ExpirationTarget, HandlerError,
    InMemoryStore, MessageExpiry, TimerHandler, TimerRecord, UpsertOutcome,
};
use chrono::Duration;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// A toy message board whose messages can be removed by expiration timers.
struct MessageBoard {
    messages: Mutex<HashSet<(u64, u64)>>,
    removed: Mutex<Vec<u64>>,
    handled: watch::Sender<usize>,
}

impl MessageBoard {
    fn new() -> Self {
        let (handled, _) = watch::channel(0);
        Self {
            messages: Mutex::new(HashSet::new()),
            removed: Mutex::new(Vec::new()),
            handled,
        }
    }

    async fn post(&self, channel_id: u64, message_id: u64) {
        self.messages.lock().await.insert((channel_id, message_id));
    }

    async fn contains(&self, channel_id: u64, message_id: u64) -> bool {
        self.messages.lock().await.contains(&(channel_id, message_id))
    }

    async fn wait_for_handled(&self, n: usize) -> bool {
        let mut rx = self.handled.subscribe();
        tokio::time::timeout(LONG_WAIT, rx.wait_for(|count| *count >= n))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    async fn remove(&self, timer: &TimerRecord) -> Result<(), HandlerError> {
        let target = ExpirationTarget::from_timer(timer)?;
        let existed = self
            .messages
            .lock()
            .await
            .remove(&(target.channel_id, target.message_id));
        if !existed {
            return Err(HandlerError::TargetGone(format!(
                "message {} in channel {}",
                target.message_id, target.channel_id
            )));
        }
        self.removed.lock().await.push(target.message_id);
        Ok(())
    }
}

#[async_trait]
impl TimerHandler for MessageBoard {
    async fn handle(&self, timer: &TimerRecord) -> Result<(), HandlerError> {
        let result = self.remove(timer).await;
        self.handled.send_modify(|count| *count += 1);
        result
    }
}

struct Setup {
    board: Arc<MessageBoard>,
    clock: Arc<VirtualClock>,
    handle: DispatcherHandle<InMemoryStore>,
    expiry: MessageExpiry<InMemoryStore>,
    task: JoinHandle<Result<(), chrona::DispatcherError>>,
}

async fn setup() -> Setup {
    let board = Arc::new(MessageBoard::new());
    let router = Arc::new(EventRouter::new());
    router.register("message_expiration", board.clone()).await;

    let clock = Arc::new(VirtualClock::new());
    let (handle, task) = Dispatcher::new(InMemoryStore::new(), router)
        .with_clock(clock.clone())
        .start();
    let expiry = MessageExpiry::new(handle.clone());

    Setup {
        board,
        clock,
        handle,
        expiry,
        task,
    }
}

impl Setup {
    async fn stop(self) {
        self.handle.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

/// Test: Messages in an expiring channel disappear after the channel expiry.
#[tokio::test(start_paused = true)]
async fn test_messages_disappear_after_channel_expiry() {
    let s = setup().await;
    s.expiry
        .set_channel_expiry(1, std::time::Duration::from_secs(24 * 3600))
        .await
        .unwrap();

    let posted = s.clock.now();
    for message_id in [10, 11] {
        s.board.post(1, message_id).await;
        s.expiry.on_message(1, message_id, posted).await.unwrap();
    }
    s.board.post(2, 20).await;
    assert!(s.expiry.on_message(2, 20, posted).await.unwrap().is_none());

    assert!(s.board.wait_for_handled(2).await);
    assert!(s.clock.now() >= posted + Duration::days(1));
    assert!(!s.board.contains(1, 10).await);
    assert!(!s.board.contains(1, 11).await);
    assert!(s.board.contains(2, 20).await);
    assert!(s.expiry.expires_at(10).await.unwrap().is_none());
    s.stop().await;
}

/// Test: Old messages expire right away when their deadline already passed.
#[tokio::test(start_paused = true)]
async fn test_backdated_message_expires_immediately() {
    let s = setup().await;
    s.expiry
        .set_channel_expiry(1, std::time::Duration::from_secs(60))
        .await
        .unwrap();
    s.board.post(1, 7).await;

    let posted = s.clock.now() - Duration::hours(1);
    let timer = s.expiry.on_message(1, 7, posted).await.unwrap().unwrap();

    assert!(timer.is_persisted());
    assert!(timer.expires < s.clock.now());
    assert!(s.board.wait_for_handled(1).await);
    assert!(!s.board.contains(1, 7).await);
    assert!(s.expiry.expires_at(7).await.unwrap().is_none());
    s.stop().await;
}

/// Test: A message deleted by hand makes the handler fail quietly.
#[tokio::test(start_paused = true)]
async fn test_missing_message_does_not_stop_dispatcher() {
    let s = setup().await;
    s.expiry
        .set_channel_expiry(1, std::time::Duration::from_secs(600))
        .await
        .unwrap();
    let posted = s.clock.now();

    s.expiry.on_message(1, 1, posted).await.unwrap();
    s.board.post(1, 2).await;
    s.expiry
        .on_message(1, 2, posted + Duration::minutes(1))
        .await
        .unwrap();

    assert!(s.board.wait_for_handled(2).await);
    assert_eq!(*s.board.removed.lock().await, vec![2]);
    assert!(s.handle.is_running());
    s.stop().await;
}

/// Test: A posted message's expiration can be pulled earlier with keep_until.
#[tokio::test(start_paused = true)]
async fn test_keep_until_applies_to_posted_message() {
    let s = setup().await;
    s.expiry
        .set_channel_expiry(1, std::time::Duration::from_secs(3600))
        .await
        .unwrap();
    let posted = s.clock.now();
    s.board.post(1, 100).await;
    s.expiry.on_message(1, 100, posted).await.unwrap();

    let later = s
        .expiry
        .keep_until(1, 100, posted + Duration::hours(2))
        .await
        .unwrap();
    assert!(matches!(later, UpsertOutcome::Kept(_)));
    let sooner = s
        .expiry
        .keep_until(1, 100, posted + Duration::minutes(30))
        .await
        .unwrap();
    assert!(matches!(sooner, UpsertOutcome::Replaced { .. }));

    assert!(s.board.wait_for_handled(1).await);
    assert!(s.clock.now() < posted + Duration::hours(1));
    assert!(!s.board.contains(1, 100).await);

    tokio::time::sleep(std::time::Duration::from_secs(3 * 3600)).await;
    assert_eq!(*s.board.handled.borrow(), 1);
    s.stop().await;
}

/// Test: keep_until pulls a pending expiration earlier but never later.
#[tokio::test(start_paused = true)]
async fn test_keep_until_moves_expiration_earlier() {
    let s = setup().await;
    let now = s.clock.now();
    s.board.post(3, 30).await;

    s.expiry
        .keep_until(3, 30, now + Duration::days(7))
        .await
        .unwrap();
    s.expiry
        .keep_until(3, 30, now + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(
        s.expiry.expires_at(30).await.unwrap(),
        Some(now + Duration::days(7))
    );

    s.expiry
        .keep_until(3, 30, now + Duration::days(2))
        .await
        .unwrap();

    assert!(s.board.wait_for_handled(1).await);
    let fired_at = s.clock.now();
    assert!(fired_at >= now + Duration::days(2));
    assert!(fired_at < now + Duration::days(7));
    assert!(!s.board.contains(3, 30).await);

    tokio::time::sleep(std::time::Duration::from_secs(30 * 24 * 3600)).await;
    assert_eq!(*s.board.handled.borrow(), 1);
    s.stop().await;
}
