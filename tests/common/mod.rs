//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chrona::testing::{RecordingSink, VirtualClock};
use chrona::{Dispatcher, DispatcherError, DispatcherHandle, TimerStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Upper bound for waits under paused tokio time; auto-advance makes them
/// instant, the bound only guards against a hung dispatcher.
pub const LONG_WAIT: Duration = Duration::from_secs(400 * 24 * 60 * 60);

/// A dispatcher running on virtual time with a recording sink.
pub struct Harness<S: TimerStore + 'static> {
    pub store: Arc<S>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<VirtualClock>,
    pub handle: DispatcherHandle<S>,
    pub task: JoinHandle<Result<(), DispatcherError>>,
}

impl<S: TimerStore + 'static> Harness<S> {
    /// Start a dispatcher over `store` with default settings.
    pub fn start(store: Arc<S>) -> Self {
        Self::start_with(store, |d| d)
    }

    /// Start a dispatcher over `store`, letting the caller adjust the builder.
    pub fn start_with(
        store: Arc<S>,
        configure: impl FnOnce(Dispatcher<S>) -> Dispatcher<S>,
    ) -> Self {
        let clock = Arc::new(VirtualClock::new());
        let sink = Arc::new(RecordingSink::with_clock(clock.clone()));
        let dispatcher = Dispatcher::with_store(Arc::clone(&store), sink.clone())
            .with_clock(clock.clone());
        let (handle, task) = configure(dispatcher).start();
        Self {
            store,
            sink,
            clock,
            handle,
            task,
        }
    }

    /// Shut down and assert the loop exited cleanly.
    pub async fn stop(self) {
        self.handle.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

/// Wait until the store holds exactly `expected` pending timers.
///
/// Polls the store every 10ms and panics when the timeout is reached.
pub async fn wait_for_pending(store: &dyn TimerStore, expected: usize, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let pending = store.list_pending(usize::MAX).await.unwrap();
        if pending.len() == expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} pending timers, current: {}",
                expected,
                pending.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
