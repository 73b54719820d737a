//! Timer completion events and event routing.
//!
//! When a timer matures the dispatcher hands the record to an [`EventSink`].
//! The standard sink is the [`EventRouter`], which looks up a
//! [`TimerHandler`] under the record's handler key
//! (`"<event>_timer_complete"`) and invokes it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::timer::{HANDLER_SUFFIX, PayloadError, TimerRecord};

/// Receiver of matured timers.
///
/// Called once the deadline has passed and the record has been removed from
/// the store. Delivery is at-least-once. Sinks swallow their own failures.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver a matured timer.
    async fn dispatch(&self, timer: &TimerRecord);
}

/// Errors a handler may report. They are logged and never reach the
/// dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not have the shape the handler expects.
    #[error("bad payload: {0}")]
    Payload(#[from] PayloadError),

    /// Whatever the timer refers to no longer exists.
    #[error("target gone: {0}")]
    TargetGone(String),

    /// Any other handler failure.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Handler for one event category.
#[async_trait]
pub trait TimerHandler: Send + Sync {
    /// Handle a matured timer.
    async fn handle(&self, timer: &TimerRecord) -> Result<(), HandlerError>;
}

/// Sink that routes timers to handlers by event name.
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Arc<dyn TimerHandler>>>,
}

impl EventRouter {
    /// Create a router with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the handler for `event`, replacing any previous one.
    pub async fn register(&self, event: &str, handler: Arc<dyn TimerHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(format!("{}{}", event, HANDLER_SUFFIX), handler);
    }

    /// Whether a handler is registered for `event`.
    pub async fn has_handler(&self, event: &str) -> bool {
        let key = format!("{}{}", event, HANDLER_SUFFIX);
        self.handlers.read().await.contains_key(&key)
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn dispatch(&self, timer: &TimerRecord) {
        let key = timer.handler_key();
        let handler = self.handlers.read().await.get(&key).cloned();

        let Some(handler) = handler else {
            tracing::debug!(handler = %key, timer = %timer, "no handler registered, dropping");
            return;
        };

        if let Err(e) = handler.handle(timer).await {
            tracing::warn!(
                handler = %key,
                timer_id = ?timer.id,
                error = %e,
                "timer handler failed"
            );
        }
    }
}
