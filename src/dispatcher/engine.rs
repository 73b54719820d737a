//! Dispatcher engine implementation.
//!
//! The dispatcher is responsible for:
//! - Arming the earliest pending timer and sleeping until it is due
//! - Deleting matured timers and notifying the event sink
//! - Re-arming when a sooner timer is scheduled
//! - Restarting after storage connection failures

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::core::clock::{Clock, SystemClock, sleep_until};
use crate::core::timer::TimerRecord;
use crate::events::EventSink;
use crate::storage::TimerStore;

use super::handle::DispatcherHandle;
use super::types::{DispatcherError, DispatcherState};

/// Timers due within this window skip the store and fire from memory.
pub const DEFAULT_FAST_PATH_THRESHOLD: Duration = Duration::from_secs(5);

/// Loop state guarded by a single lock.
pub(super) struct LoopState {
    /// Timer the loop is currently sleeping on.
    pub(super) current: Option<TimerRecord>,
    /// Token of the running loop iteration; cancelling it re-arms.
    pub(super) iteration: CancellationToken,
    pub(super) phase: DispatcherState,
}

/// State shared between the dispatch loop and its handles.
pub(super) struct Shared<S: TimerStore> {
    pub(super) store: Arc<S>,
    pub(super) sink: Arc<dyn EventSink>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) fast_path_threshold: Duration,
    /// Root token; cancelled on shutdown.
    pub(super) shutdown: CancellationToken,
    /// Bumped on every persisted schedule.
    pub(super) wake: watch::Sender<u64>,
    pub(super) state_tx: watch::Sender<DispatcherState>,
    pub(super) inner: Mutex<LoopState>,
}

impl<S: TimerStore> Shared<S> {
    /// Update the phase. Callers hold the `inner` lock.
    pub(super) fn set_phase(&self, inner: &mut LoopState, phase: DispatcherState) {
        inner.phase = phase;
        self.state_tx.send_replace(phase);
    }

    /// Raise the "have timer" signal.
    pub(super) fn raise_signal(&self) {
        self.wake.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }
}

/// The timer dispatcher.
pub struct Dispatcher<S: TimerStore> {
    store: Arc<S>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    fast_path_threshold: Duration,
    restart_delay: Duration,
}

impl<S: TimerStore + 'static> Dispatcher<S> {
    /// Create a new dispatcher with the given store and sink.
    pub fn new(store: S, sink: Arc<dyn EventSink>) -> Self {
        Self::with_store(Arc::new(store), sink)
    }

    /// Create a new dispatcher with a shared store.
    pub fn with_store(store: Arc<S>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink,
            clock: Arc::new(SystemClock),
            fast_path_threshold: DEFAULT_FAST_PATH_THRESHOLD,
            restart_delay: Duration::ZERO,
        }
    }

    /// Create a dispatcher using the tunables from a configuration.
    pub fn from_config(config: &DispatcherConfig, store: Arc<S>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_store(store, sink)
            .with_fast_path_threshold(config.fast_path_threshold())
            .with_restart_delay(config.restart_delay())
    }

    /// Set the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the fast-path window. Zero disables the fast path except for
    /// deadlines that have already passed.
    pub fn with_fast_path_threshold(mut self, threshold: Duration) -> Self {
        self.fast_path_threshold = threshold;
        self
    }

    /// Set the pause before relaunching the loop after a connection failure.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Start the dispatch loop and return a handle for controlling it.
    ///
    /// The join handle resolves to `Ok(())` after shutdown, or to the error
    /// that stopped the loop.
    pub fn start(self) -> (DispatcherHandle<S>, JoinHandle<Result<(), DispatcherError>>) {
        let (wake, _) = watch::channel(0);
        let (state_tx, _) = watch::channel(DispatcherState::Idle);
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            store: self.store,
            sink: self.sink,
            clock: self.clock,
            fast_path_threshold: self.fast_path_threshold,
            shutdown: shutdown.clone(),
            wake,
            state_tx,
            inner: Mutex::new(LoopState {
                current: None,
                iteration: shutdown.child_token(),
                phase: DispatcherState::Idle,
            }),
        });

        let handle = DispatcherHandle::new(Arc::clone(&shared));
        let restart_delay = self.restart_delay;
        let task = tokio::spawn(async move { supervise(shared, restart_delay).await });

        (handle, task)
    }
}

/// Run loop iterations until shutdown or a fatal error.
async fn supervise<S: TimerStore>(
    shared: Arc<Shared<S>>,
    restart_delay: Duration,
) -> Result<(), DispatcherError> {
    tracing::info!("Timer dispatcher started");

    let result = loop {
        if shared.shutdown.is_cancelled() {
            break Ok(());
        }

        let token = shared.shutdown.child_token();
        {
            let mut inner = shared.inner.lock().await;
            inner.iteration = token.clone();
        }

        match run_iteration(&shared, &token).await {
            Ok(()) => {
                if !shared.shutdown.is_cancelled() {
                    tracing::debug!("Sooner timer scheduled, re-arming");
                }
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Timer dispatching restarting");
                {
                    let mut inner = shared.inner.lock().await;
                    inner.current = None;
                    shared.set_phase(&mut inner, DispatcherState::Restarting);
                }
                if !restart_delay.is_zero() {
                    tokio::select! {
                        _ = shared.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(restart_delay) => {}
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Timer dispatching stopped");
                break Err(e);
            }
        }
    };

    {
        let mut inner = shared.inner.lock().await;
        inner.current = None;
        shared.set_phase(&mut inner, DispatcherState::Stopped);
    }
    tracing::info!("Timer dispatcher stopped");
    result
}

/// One loop iteration: wait for a timer, sleep until it is due, fire it,
/// repeat. Returns `Ok` when the iteration token is cancelled.
async fn run_iteration<S: TimerStore>(
    shared: &Shared<S>,
    token: &CancellationToken,
) -> Result<(), DispatcherError> {
    let mut wake_rx = shared.wake.subscribe();

    loop {
        wake_rx.borrow_and_update();

        let earliest = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            earliest = shared.store.get_earliest() => earliest?,
        };

        let Some(timer) = earliest else {
            {
                let mut inner = shared.inner.lock().await;
                inner.current = None;
                shared.set_phase(&mut inner, DispatcherState::Idle);
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                changed = wake_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
            continue;
        };

        {
            let mut inner = shared.inner.lock().await;
            if token.is_cancelled() {
                return Ok(());
            }
            // A schedule landed after the read; the store may now hold a
            // sooner timer.
            if wake_rx.has_changed().unwrap_or(false) {
                continue;
            }
            inner.current = Some(timer.clone());
            shared.set_phase(&mut inner, DispatcherState::Armed);
        }
        tracing::debug!(
            timer_id = ?timer.id,
            event = %timer.event,
            expires = %timer.expires,
            "Timer armed"
        );

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = sleep_until(shared.clock.as_ref(), timer.expires) => {}
        }

        {
            let mut inner = shared.inner.lock().await;
            if token.is_cancelled() {
                return Ok(());
            }
            shared.set_phase(&mut inner, DispatcherState::Firing);
        }

        fire(shared, &timer).await?;

        let mut inner = shared.inner.lock().await;
        inner.current = None;
        shared.set_phase(&mut inner, DispatcherState::Idle);
    }
}

/// Delete a matured timer and hand it to the sink.
async fn fire<S: TimerStore>(
    shared: &Shared<S>,
    timer: &TimerRecord,
) -> Result<(), DispatcherError> {
    if let Some(id) = timer.id {
        shared.store.delete(id).await?;
    }
    tracing::debug!(timer_id = ?timer.id, event = %timer.event, "Dispatching timer");
    shared.sink.dispatch(timer).await;
    Ok(())
}
