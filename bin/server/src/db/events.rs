//! Postgres-backed event store.

use super::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use trigger_relay_core::{EventId, TriggerId};
use trigger_relay_events::{Event, EventQuery, EventStatus, EventStore, EventStoreError, RetentionState};
use trigger_relay_trigger::TriggerType;

/// Row type for event queries.
#[derive(FromRow)]
struct EventRow {
    id: String,
    trigger_id: String,
    trigger_name: String,
    trigger_type: String,
    status: String,
    execution_time: DateTime<Utc>,
    is_test: bool,
    is_manual: bool,
    request_payload: Option<serde_json::Value>,
    response_data: Option<serde_json::Value>,
    error_message: Option<String>,
    retention_state: String,
    created_at: DateTime<Utc>,
    archive_time: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
    archived_at: Option<DateTime<Utc>>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event, sqlx::Error> {
        let id = EventId::from_str(&self.id)
            .map_err(|e| decode_error(format!("invalid event id '{}': {e}", self.id)))?;
        let trigger_id = TriggerId::from_str(&self.trigger_id)
            .map_err(|e| decode_error(format!("event {id}: invalid trigger id: {e}")))?;

        Ok(Event {
            id,
            trigger_id,
            trigger_name: self.trigger_name,
            trigger_type: TriggerType::from_str(&self.trigger_type).map_err(decode_error)?,
            status: EventStatus::from_str(&self.status).map_err(decode_error)?,
            execution_time: self.execution_time,
            is_test: self.is_test,
            is_manual: self.is_manual,
            request_payload: self.request_payload,
            response_data: self.response_data,
            error_message: self.error_message,
            retention_state: RetentionState::from_str(&self.retention_state)
                .map_err(decode_error)?,
            created_at: self.created_at,
            archive_time: self.archive_time,
            expiry_time: self.expiry_time,
            archived_at: self.archived_at,
        })
    }
}

fn storage(e: impl std::fmt::Display) -> EventStoreError {
    EventStoreError::StorageFailed {
        reason: e.to_string(),
    }
}

/// Event store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Creates a new store.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create(&self, event: Event) -> Result<EventId, EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO events
                (id, trigger_id, trigger_name, trigger_type, status, execution_time,
                 is_test, is_manual, request_payload, response_data, error_message,
                 retention_state, created_at, archive_time, expiry_time, archived_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.trigger_id.to_string())
        .bind(&event.trigger_name)
        .bind(event.trigger_type.as_str())
        .bind(event.status.as_str())
        .bind(event.execution_time)
        .bind(event.is_test)
        .bind(event.is_manual)
        .bind(&event.request_payload)
        .bind(&event.response_data)
        .bind(&event.error_message)
        .bind(event.retention_state.as_str())
        .bind(event.created_at)
        .bind(event.archive_time)
        .bind(event.expiry_time)
        .bind(event.archived_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(event.id)
    }

    async fn find(&self, query: &EventQuery) -> Result<Vec<Event>, EventStoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, trigger_id, trigger_name, trigger_type, status, execution_time,
                   is_test, is_manual, request_payload, response_data, error_message,
                   retention_state, created_at, archive_time, expiry_time, archived_at
            FROM events
            WHERE ($1::text IS NULL OR retention_state = $1)
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at < $3)
              AND ($4::text IS NULL OR trigger_id = $4)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(query.retention_state.map(RetentionState::as_str))
        .bind(query.created_after)
        .bind(query.created_before)
        .bind(query.trigger_id.map(|id| id.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|r| r.try_into_event().map_err(storage))
            .collect()
    }

    async fn update_retention_state(
        &self,
        id: EventId,
        from: RetentionState,
        to: RetentionState,
        at: DateTime<Utc>,
    ) -> Result<bool, EventStoreError> {
        let archived_at = (to == RetentionState::Archived).then_some(at);
        let result = sqlx::query(
            r#"
            UPDATE events
            SET retention_state = $3, archived_at = COALESCE($4, archived_at)
            WHERE id = $1 AND retention_state = $2
            "#,
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(archived_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventStoreError> {
        let result = sqlx::query("DELETE FROM events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        Ok(result.rows_affected())
    }
}
