//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Timestamps are stored
//! as epoch milliseconds and payloads as JSON text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{
    ExpirySettings, MESSAGE_EXPIRATION_EVENT, StorageError, TimerStore, UpsertOutcome, missing_key,
};
use crate::core::timer::{TimerPayload, TimerRecord};
use crate::core::types::TimerId;

type TimerRow = (i64, String, i64, i64, String, Option<String>);

const SELECT_TIMER: &str =
    "SELECT id, event, created_at, expires, payload, dedupe_key FROM timers";

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        // A single connection that is never recycled; the database lives
        // and dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_timers.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    ///
    /// Later calls fail with [`StorageError::Connection`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Classify a driver error. Connectivity failures become
/// [`StorageError::Connection`] so the dispatcher restarts instead of dying.
fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Connection(err.to_string()),
        sqlx::Error::Database(ref e) if e.is_unique_violation() => {
            StorageError::DuplicateKey(e.message().to_string())
        }
        other => StorageError::Other(other.to_string()),
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        StorageError::SerializationError(format!("timestamp out of range: {}", millis))
    })
}

fn row_to_timer(row: TimerRow) -> Result<TimerRecord, StorageError> {
    let (id, event, created_at, expires, payload, key) = row;
    let payload = TimerPayload::from_json(&payload)
        .map_err(|e| StorageError::SerializationError(format!("timer {}: {}", id, e)))?;
    Ok(TimerRecord::persisted(
        TimerId::new(id),
        event,
        from_millis(created_at)?,
        from_millis(expires)?,
        payload,
        key,
    ))
}

fn encode_payload(timer: &TimerRecord) -> Result<String, StorageError> {
    timer
        .payload
        .to_json()
        .map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn to_sql_id(value: u64, what: &str) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Other(format!("{} out of range: {}", what, value)))
}

async fn insert_timer<'e, E>(executor: E, timer: &TimerRecord) -> Result<TimerId, StorageError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO timers (event, created_at, expires, payload, dedupe_key)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&timer.event)
    .bind(to_millis(timer.created_at))
    .bind(to_millis(timer.expires))
    .bind(encode_payload(timer)?)
    .bind(timer.key.as_deref())
    .execute(executor)
    .await
    .map_err(map_sqlx_error)?;

    Ok(TimerId::new(result.last_insert_rowid()))
}

#[async_trait]
impl TimerStore for SqliteStore {
    async fn create(&self, timer: &TimerRecord) -> Result<TimerId, StorageError> {
        insert_timer(&self.pool, timer).await
    }

    async fn delete(&self, id: TimerId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM timers WHERE id = ?")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_earliest(&self) -> Result<Option<TimerRecord>, StorageError> {
        let row: Option<TimerRow> =
            sqlx::query_as(&format!("{} ORDER BY expires, id LIMIT 1", SELECT_TIMER))
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        row.map(row_to_timer).transpose()
    }

    async fn create_or_update(&self, timer: &TimerRecord) -> Result<UpsertOutcome, StorageError> {
        let key = timer.key.as_deref().ok_or_else(|| missing_key(timer))?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let existing: Option<TimerRow> =
            sqlx::query_as(&format!("{} WHERE dedupe_key = ?", SELECT_TIMER))
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

        let outcome = match existing.map(row_to_timer).transpose()? {
            None => UpsertOutcome::Created(insert_timer(&mut *tx, timer).await?),
            Some(existing) if timer.expires < existing.expires => {
                let previous = existing
                    .id
                    .ok_or_else(|| StorageError::Other("stored timer has no id".to_string()))?;
                sqlx::query("DELETE FROM timers WHERE id = ?")
                    .bind(previous.get())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                let id = insert_timer(&mut *tx, timer).await?;
                UpsertOutcome::Replaced { id, previous }
            }
            Some(existing) => UpsertOutcome::Kept(existing),
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn get(&self, id: TimerId) -> Result<Option<TimerRecord>, StorageError> {
        let row: Option<TimerRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_TIMER))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(row_to_timer).transpose()
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<TimerRecord>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<TimerRow> =
            sqlx::query_as(&format!("{} ORDER BY expires, id LIMIT ?", SELECT_TIMER))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        rows.into_iter().map(row_to_timer).collect()
    }
}

#[async_trait]
impl ExpirySettings for SqliteStore {
    async fn channel_expiry(&self, channel_id: u64) -> Result<Option<Duration>, StorageError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT expiry_ms FROM channel_expiry WHERE channel_id = ?")
                .bind(to_sql_id(channel_id, "channel id")?)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(row.map(|(ms,)| Duration::from_millis(ms.max(0) as u64)))
    }

    async fn set_channel_expiry(
        &self,
        channel_id: u64,
        expiry: Duration,
    ) -> Result<(), StorageError> {
        let expiry_ms = i64::try_from(expiry.as_millis())
            .map_err(|_| StorageError::Other(format!("expiry too large: {:?}", expiry)))?;
        sqlx::query(
            r#"
            INSERT INTO channel_expiry (channel_id, expiry_ms) VALUES (?, ?)
            ON CONFLICT(channel_id) DO UPDATE SET expiry_ms = excluded.expiry_ms
            "#,
        )
        .bind(to_sql_id(channel_id, "channel id")?)
        .bind(expiry_ms)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn clear_channel_expiry(&self, channel_id: u64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM channel_expiry WHERE channel_id = ?")
            .bind(to_sql_id(channel_id, "channel id")?)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn message_expiration(
        &self,
        message_id: u64,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            SELECT MIN(expires) FROM timers
            WHERE event = ? AND json_extract(payload, '$.kwargs.message_id') = ?
            "#,
        )
        .bind(MESSAGE_EXPIRATION_EVENT)
        .bind(to_sql_id(message_id, "message id")?)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.and_then(|(expires,)| expires).map(from_millis).transpose()
    }
}
