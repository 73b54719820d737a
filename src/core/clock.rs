//! Time source abstraction.
//!
//! The dispatcher never reads the wall clock or sleeps directly; it goes
//! through a [`Clock`] so tests can drive time deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Longest single sleep issued while waiting for a deadline (40 days).
///
/// Longer waits are split into repeated sleeps of at most this length.
pub const MAX_SLEEP: Duration = Duration::from_secs(40 * 60 * 60 * 24);

/// Source of "now" and of sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by chrono and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleep until `deadline`, returning immediately if it has already passed.
///
/// The remaining time is recomputed from the clock after every chunk, so
/// clock drift during a long wait does not accumulate.
pub async fn sleep_until(clock: &dyn Clock, deadline: DateTime<Utc>) {
    loop {
        let remaining = match (deadline - clock.now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return,
        };
        clock.sleep(remaining.min(MAX_SLEEP)).await;
    }
}
