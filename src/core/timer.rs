//! Timer records and their opaque payloads.
//!
//! A [`TimerRecord`] describes one scheduled event. The dispatcher never
//! looks inside the [`TimerPayload`]; it stores it verbatim and hands it to
//! the event sink, where each handler decodes the shape it expects.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use super::duration::natural_delta;
use super::types::TimerId;

/// Suffix appended to an event name to form its handler key.
pub const HANDLER_SUFFIX: &str = "_timer_complete";

/// Source of identity tokens for records that have no store id yet.
static NEXT_LOCAL_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Errors raised while building or decoding a payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// A value could not be converted to JSON.
    #[error("failed to serialize payload value: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Named arguments did not serialize to a JSON object.
    #[error("named arguments must serialize to an object, got {0}")]
    NotAnObject(String),

    /// The stored payload document is not `{args, kwargs}` shaped.
    #[error("malformed payload document: {0}")]
    Malformed(#[source] serde_json::Error),

    /// A positional argument is missing.
    #[error("missing positional argument {0}")]
    MissingArg(usize),

    /// A named argument is missing.
    #[error("missing named argument '{0}'")]
    MissingKwarg(String),

    /// An argument exists but has the wrong shape.
    #[error("failed to decode argument '{name}': {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Positional and named arguments delivered with a timer.
///
/// Persisted as `{"args": [...], "kwargs": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerPayload {
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Named arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TimerPayload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a payload from already-converted parts.
    pub fn from_parts(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Append a positional argument.
    pub fn with_arg<T: Serialize>(mut self, value: T) -> Result<Self, PayloadError> {
        let value = serde_json::to_value(value).map_err(PayloadError::Serialize)?;
        self.args.push(value);
        Ok(self)
    }

    /// Set a named argument.
    pub fn with_kwarg<T: Serialize>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<Self, PayloadError> {
        let value = serde_json::to_value(value).map_err(PayloadError::Serialize)?;
        self.kwargs.insert(name.into(), value);
        Ok(self)
    }

    /// Merge every field of a serializable struct or map into the named arguments.
    pub fn with_kwargs<T: Serialize>(mut self, kwargs: T) -> Result<Self, PayloadError> {
        match serde_json::to_value(kwargs).map_err(PayloadError::Serialize)? {
            Value::Object(map) => {
                self.kwargs.extend(map);
                Ok(self)
            }
            other => Err(PayloadError::NotAnObject(other.to_string())),
        }
    }

    /// Decode the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, PayloadError> {
        let value = self
            .args
            .get(index)
            .ok_or(PayloadError::MissingArg(index))?;
        serde_json::from_value(value.clone()).map_err(|source| PayloadError::Decode {
            name: index.to_string(),
            source,
        })
    }

    /// Decode the named argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, PayloadError> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| PayloadError::MissingKwarg(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| PayloadError::Decode {
            name: name.to_string(),
            source,
        })
    }

    /// Encode as a JSON document.
    pub fn to_json(&self) -> Result<String, PayloadError> {
        serde_json::to_string(self).map_err(PayloadError::Serialize)
    }

    /// Decode a stored JSON document. Missing `args`/`kwargs` default to empty.
    pub fn from_json(document: &str) -> Result<Self, PayloadError> {
        serde_json::from_str(document).map_err(PayloadError::Malformed)
    }
}

/// One scheduled event.
///
/// Two records are equal iff their ids are equal. A record without an id is
/// only equal to itself (and its clones), so unpersisted fast-path timers are
/// never treated as duplicates of each other.
#[derive(Debug, Clone)]
pub struct TimerRecord {
    /// Store-assigned identifier; `None` until persisted.
    pub id: Option<TimerId>,
    /// Event category, routed to `"<event>_timer_complete"`.
    pub event: String,
    /// When the timer was created.
    pub created_at: DateTime<Utc>,
    /// When the timer fires. Never changed once persisted.
    pub expires: DateTime<Utc>,
    /// Arguments passed through to the handler.
    pub payload: TimerPayload,
    /// Optional de-duplication key for create-or-update scheduling.
    pub key: Option<String>,
    local_token: u64,
}

impl TimerRecord {
    /// Create a new, unpersisted record.
    pub fn new(
        event: impl Into<String>,
        created_at: DateTime<Utc>,
        expires: DateTime<Utc>,
        payload: TimerPayload,
    ) -> Self {
        Self {
            id: None,
            event: event.into(),
            created_at,
            expires,
            payload,
            key: None,
            local_token: NEXT_LOCAL_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Rebuild a record read back from a store.
    pub fn persisted(
        id: TimerId,
        event: impl Into<String>,
        created_at: DateTime<Utc>,
        expires: DateTime<Utc>,
        payload: TimerPayload,
        key: Option<String>,
    ) -> Self {
        Self::new(event, created_at, expires, payload)
            .with_id(id)
            .with_optional_key(key)
    }

    /// Set the store id.
    pub fn with_id(mut self, id: TimerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the de-duplication key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    fn with_optional_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    /// Whether the record has been written to a store.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Name under which the handler for this record is registered.
    pub fn handler_key(&self) -> String {
        format!("{}{}", self.event, HANDLER_SUFFIX)
    }

    /// Time left until the deadline, clamped to zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires - now).to_std().unwrap_or_default()
    }

    /// Human readable age of the record, e.g. "5 minutes ago".
    pub fn human_delta(&self, now: DateTime<Utc>) -> String {
        natural_delta(self.created_at, now)
    }
}

impl PartialEq for TimerRecord {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.local_token == other.local_token,
            _ => false,
        }
    }
}

impl Eq for TimerRecord {}

impl Hash for TimerRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.id {
            Some(id) => id.hash(state),
            None => self.local_token.hash(state),
        }
    }
}

impl fmt::Display for TimerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "timer #{} ", id)?,
            None => write!(f, "timer (unpersisted) ")?,
        }
        write!(
            f,
            "event={} created_at={} expires={}",
            self.event,
            self.created_at.to_rfc3339(),
            self.expires.to_rfc3339()
        )
    }
}
