#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-event-log-sql** – Durable SQL event log driver (C1) for the
//! ApplicationAccess sharded event pipeline.
//!
//! Generalizes the teacher's per-database-type factory class (see
//! `spec.md` §9) into a single [`StorageDriver`] enum built once from
//! connection parameters and held behind [`sqlx::any::AnyPool`], so the rest
//! of the pipeline depends on one trait object rather than one crate per
//! engine. Grounded on `toka-store-sqlite::SqliteBackend`'s migrate-on-open,
//! `INSERT OR IGNORE`-dedup, broadcast-on-commit shape.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use aam_event_log_core::{deletion_order, DeletionPhase, EventLogStore};
use aam_types::error::AamError;
use aam_types::event::{Action, Event, EventId, EventKind};
use aam_types::shard::HashRange;

/// Which SQL engine a connection string addresses. Construction inspects
/// the URL scheme once, at `SqlEventLog::connect` time; after that the
/// pipeline only ever talks to the `EventLogStore` trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    /// `sqlite://…` — embedded, file-backed or in-memory.
    Sqlite,
    /// `postgres://…` — networked, multi-writer.
    Postgres,
}

impl StorageDriver {
    fn from_url(database_url: &str) -> Result<Self, AamError> {
        if database_url.starts_with("sqlite:") {
            Ok(StorageDriver::Sqlite)
        } else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
            Ok(StorageDriver::Postgres)
        } else {
            Err(AamError::ValidationError(format!("unrecognized database url scheme: {database_url}")))
        }
    }
}

fn kind_tag_of(phase: DeletionPhase) -> i64 {
    match phase {
        DeletionPhase::UserPrimary => 0,
        DeletionPhase::GroupPrimary => 1,
        DeletionPhase::UserToGroupMapping => 2,
        DeletionPhase::UserToComponentAccess => 4,
        DeletionPhase::GroupToComponentAccess => 5,
        DeletionPhase::UserToEntityMapping => 8,
        DeletionPhase::GroupToEntityMapping => 9,
    }
}

fn encode_kind(kind: &EventKind) -> Result<String, AamError> {
    serde_json::to_string(kind).map_err(|e| AamError::StorageFault(format!("encode event kind: {e}")))
}

fn decode_kind(raw: &str) -> Result<EventKind, AamError> {
    serde_json::from_str(raw).map_err(|e| AamError::StorageFault(format!("decode event kind: {e}")))
}

fn row_to_event(row: &AnyRow) -> Result<Event, AamError> {
    let event_id: EventId = row
        .try_get::<String, _>("event_id")
        .map_err(|e| AamError::StorageFault(e.to_string()))?
        .parse()
        .map_err(|e| AamError::StorageFault(format!("invalid event id: {e}")))?;
    let kind = decode_kind(&row.try_get::<String, _>("payload").map_err(|e| AamError::StorageFault(e.to_string()))?)?;
    let action = if row.try_get::<i64, _>("action").map_err(|e| AamError::StorageFault(e.to_string()))? == 0 {
        Action::Add
    } else {
        Action::Remove
    };
    let occurred_time: DateTime<Utc> = row
        .try_get::<String, _>("occurred_time")
        .map_err(|e| AamError::StorageFault(e.to_string()))?
        .parse()
        .map_err(|e| AamError::StorageFault(format!("invalid occurred_time: {e}")))?;
    let hash_code = row.try_get::<i64, _>("hash_code").map_err(|e| AamError::StorageFault(e.to_string()))? as i32;
    let transaction_time: DateTime<Utc> = row
        .try_get::<String, _>("transaction_time")
        .map_err(|e| AamError::StorageFault(e.to_string()))?
        .parse()
        .map_err(|e| AamError::StorageFault(format!("invalid transaction_time: {e}")))?;
    let transaction_sequence =
        row.try_get::<i64, _>("transaction_sequence").map_err(|e| AamError::StorageFault(e.to_string()))? as u64;

    let mut event = Event::new(event_id, kind, action, occurred_time);
    event.hash_code = hash_code;
    Ok(event.with_transaction_coords(transaction_time, transaction_sequence))
}

/// A durable event log backed by SQLite or PostgreSQL (selected by
/// connection string scheme), accessed via `sqlx`'s runtime-dispatched
/// `Any` driver so a single code path serves both engines.
pub struct SqlEventLog {
    pool: AnyPool,
    driver: StorageDriver,
}

impl SqlEventLog {
    /// Opens (creating if necessary) a durable event log at `database_url`,
    /// running schema migrations before returning.
    pub async fn connect(database_url: &str) -> Result<Self, AamError> {
        let driver = StorageDriver::from_url(database_url)?;
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| AamError::StorageFault(e.to_string()))?;
        let log = Self { pool, driver };
        log.migrate().await?;
        Ok(log)
    }

    /// Opens an in-memory SQLite-backed log — the default for tests and for
    /// development single-process runs.
    pub async fn in_memory() -> Result<Self, AamError> {
        Self::connect("sqlite::memory:").await
    }

    /// Which engine this instance is backed by.
    pub fn driver(&self) -> StorageDriver {
        self.driver
    }

    async fn migrate(&self) -> Result<(), AamError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                kind_tag INTEGER NOT NULL,
                payload TEXT NOT NULL,
                action INTEGER NOT NULL,
                occurred_time TEXT NOT NULL,
                hash_code INTEGER NOT NULL,
                transaction_time TEXT NOT NULL,
                transaction_sequence INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AamError::StorageFault(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_order ON events(transaction_time, transaction_sequence)")
            .execute(&self.pool)
            .await
            .map_err(|e| AamError::StorageFault(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_hash ON events(hash_code)")
            .execute(&self.pool)
            .await
            .map_err(|e| AamError::StorageFault(e.to_string()))?;

        Ok(())
    }

    /// Total number of events stored. Useful for tests and metrics.
    pub async fn event_count(&self) -> Result<i64, AamError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AamError::StorageFault(e.to_string()))?;
        row.try_get("count").map_err(|e| AamError::StorageFault(e.to_string()))
    }
}

#[async_trait]
impl EventLogStore for SqlEventLog {
    async fn append_batch(&self, events: Vec<Event>) -> Result<Vec<Event>, AamError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(|e| AamError::TransientStorageError(e.to_string()))?;
        let commit_time = Utc::now();
        let mut stamped = Vec::with_capacity(events.len());

        for (sequence, event) in events.into_iter().enumerate() {
            let stamped_event = event.with_transaction_coords(commit_time, sequence as u64);
            let payload = encode_kind(&stamped_event.kind)?;
            sqlx::query(
                r#"
                INSERT INTO events
                    (event_id, kind_tag, payload, action, occurred_time, hash_code, transaction_time, transaction_sequence)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(stamped_event.event_id.to_string())
            .bind(stamped_event.kind.tag() as i64)
            .bind(payload)
            .bind(if stamped_event.action == Action::Add { 0i64 } else { 1i64 })
            .bind(stamped_event.occurred_time.to_rfc3339())
            .bind(stamped_event.hash_code as i64)
            .bind(stamped_event.transaction_time.unwrap().to_rfc3339())
            .bind(stamped_event.transaction_sequence.unwrap() as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| AamError::TransientStorageError(e.to_string()))?;
            stamped.push(stamped_event);
        }

        tx.commit().await.map_err(|e| AamError::TransientStorageError(e.to_string()))?;

        Ok(stamped)
    }

    async fn get_initial_event(&self) -> Result<Option<Event>, AamError> {
        let row = sqlx::query("SELECT * FROM events ORDER BY transaction_time ASC, transaction_sequence ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AamError::TransientStorageError(e.to_string()))?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn get_next_after(&self, event_id: EventId) -> Result<Option<EventId>, AamError> {
        let current = sqlx::query("SELECT transaction_time, transaction_sequence FROM events WHERE event_id = ?")
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AamError::TransientStorageError(e.to_string()))?
            .ok_or(AamError::EventNotFound(event_id))?;

        let tx_time: String = current.try_get("transaction_time").map_err(|e| AamError::StorageFault(e.to_string()))?;
        let tx_seq: i64 =
            current.try_get("transaction_sequence").map_err(|e| AamError::StorageFault(e.to_string()))?;

        let next = sqlx::query(
            r#"
            SELECT event_id FROM events
            WHERE transaction_time > ? OR (transaction_time = ? AND transaction_sequence > ?)
            ORDER BY transaction_time ASC, transaction_sequence ASC
            LIMIT 1
            "#,
        )
        .bind(tx_time.clone())
        .bind(tx_time)
        .bind(tx_seq)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AamError::TransientStorageError(e.to_string()))?;

        next.map(|row| {
            row.try_get::<String, _>("event_id")
                .map_err(|e| AamError::StorageFault(e.to_string()))
                .and_then(|s| s.parse().map_err(|e| AamError::StorageFault(format!("invalid event id: {e}"))))
        })
        .transpose()
    }

    async fn get_events(
        &self,
        start_event_id: EventId,
        hash_range: HashRange,
        include_unfiltered_group_events: bool,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>, AamError> {
        if max_count == Some(0) {
            return Ok(Vec::new());
        }
        let start = sqlx::query("SELECT transaction_time, transaction_sequence FROM events WHERE event_id = ?")
            .bind(start_event_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AamError::TransientStorageError(e.to_string()))?
            .ok_or(AamError::EventNotFound(start_event_id))?;
        let tx_time: String = start.try_get("transaction_time").map_err(|e| AamError::StorageFault(e.to_string()))?;
        let tx_seq: i64 = start.try_get("transaction_sequence").map_err(|e| AamError::StorageFault(e.to_string()))?;

        // EntityType = 6, Entity = 7 are always unfiltered; Group = 1 is
        // unfiltered too unless the caller is the native group shard.
        let group_tag: i64 = 1;
        let limit = max_count.map(|n| n as i64).unwrap_or(-1);

        let query = format!(
            r#"
            SELECT * FROM events
            WHERE (transaction_time > ? OR (transaction_time = ? AND transaction_sequence >= ?))
              AND (
                    (hash_code >= ? AND hash_code <= ?)
                    OR kind_tag IN (6, 7)
                    OR (kind_tag = ? AND ? = 0)
                  )
            ORDER BY transaction_time ASC, transaction_sequence ASC
            LIMIT {}
            "#,
            if limit < 0 { i64::MAX } else { limit }
        );

        let rows = sqlx::query(&query)
            .bind(tx_time.clone())
            .bind(tx_time)
            .bind(tx_seq)
            .bind(hash_range.start as i64)
            .bind(hash_range.end as i64)
            .bind(group_tag)
            .bind(if include_unfiltered_group_events { 1i64 } else { 0i64 })
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AamError::TransientStorageError(e.to_string()))?;

        rows.iter().map(row_to_event).collect()
    }

    async fn delete_in_range(&self, hash_range: HashRange, include_group_primary: bool) -> Result<(), AamError> {
        for phase in deletion_order(include_group_primary) {
            sqlx::query("DELETE FROM events WHERE kind_tag = ? AND hash_code >= ? AND hash_code <= ?")
                .bind(kind_tag_of(phase))
                .bind(hash_range.start as i64)
                .bind(hash_range.end as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| AamError::TransientStorageError(e.to_string()))?;
        }
        Ok(())
    }

    async fn event_exists(&self, event_id: EventId) -> Result<bool, AamError> {
        let row = sqlx::query("SELECT 1 as present FROM events WHERE event_id = ?")
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AamError::TransientStorageError(e.to_string()))?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::event::Action;
    use uuid::Uuid;

    fn user_event(user: &str) -> Event {
        Event::new(Uuid::new_v4(), EventKind::User { user: user.to_string() }, Action::Add, Utc::now())
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let log = SqlEventLog::in_memory().await.unwrap();
        let stamped = log.append_batch(vec![user_event("alice"), user_event("bob")]).await.unwrap();
        assert_eq!(log.event_count().await.unwrap(), 2);

        let initial = log.get_initial_event().await.unwrap().unwrap();
        assert_eq!(initial.event_id, stamped[0].event_id);

        let next = log.get_next_after(stamped[0].event_id).await.unwrap();
        assert_eq!(next, Some(stamped[1].event_id));
    }

    #[tokio::test]
    async fn get_events_filters_by_hash_range() {
        let log = SqlEventLog::in_memory().await.unwrap();
        let stamped = log.append_batch(vec![user_event("alice"), user_event("bob")]).await.unwrap();
        let alice_hash = stamped[0].hash_code;
        let events = log
            .get_events(stamped[0].event_id, HashRange::new(alice_hash, alice_hash), true, None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, stamped[0].event_id);
    }

    #[tokio::test]
    async fn max_count_zero_returns_empty_without_querying() {
        let log = SqlEventLog::in_memory().await.unwrap();
        let stamped = log.append_batch(vec![user_event("alice")]).await.unwrap();
        let events = log.get_events(stamped[0].event_id, HashRange::FULL, true, Some(0)).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn delete_in_range_removes_matching_events() {
        let log = SqlEventLog::in_memory().await.unwrap();
        let stamped = log.append_batch(vec![user_event("alice")]).await.unwrap();
        let hash = stamped[0].hash_code;
        log.delete_in_range(HashRange::new(hash, hash), false).await.unwrap();
        assert_eq!(log.event_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_exists_reflects_committed_state() {
        let log = SqlEventLog::in_memory().await.unwrap();
        let stamped = log.append_batch(vec![user_event("alice")]).await.unwrap();
        assert!(log.event_exists(stamped[0].event_id).await.unwrap());
        assert!(!log.event_exists(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn driver_detected_from_url_scheme() {
        let log = SqlEventLog::in_memory().await.unwrap();
        assert_eq!(log.driver(), StorageDriver::Sqlite);
    }
}
