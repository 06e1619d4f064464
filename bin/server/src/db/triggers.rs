//! Postgres-backed trigger repository.

use super::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use trigger_relay_core::TriggerId;
use trigger_relay_trigger::{
    Trigger, TriggerError, TriggerFilter, TriggerKind, TriggerPatch, TriggerRepository,
    TriggerType,
};

/// Row type for trigger queries.
#[derive(FromRow)]
struct TriggerRow {
    id: String,
    name: String,
    description: Option<String>,
    trigger_type: String,
    schedule_config: Option<serde_json::Value>,
    api_config: Option<serde_json::Value>,
    is_active: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    last_triggered_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

impl TriggerRow {
    fn try_into_trigger(self) -> Result<Trigger, sqlx::Error> {
        let id = TriggerId::from_str(&self.id)
            .map_err(|e| decode_error(format!("invalid trigger id '{}': {e}", self.id)))?;
        let trigger_type = TriggerType::from_str(&self.trigger_type).map_err(decode_error)?;

        let kind = match (trigger_type, self.schedule_config, self.api_config) {
            (TriggerType::Scheduled, Some(config), _) => TriggerKind::Scheduled {
                schedule_config: serde_json::from_value(config)
                    .map_err(|e| decode_error(format!("trigger {id}: schedule_config: {e}")))?,
            },
            (TriggerType::Api, _, Some(config)) => TriggerKind::Api {
                api_config: serde_json::from_value(config)
                    .map_err(|e| decode_error(format!("trigger {id}: api_config: {e}")))?,
            },
            (trigger_type, ..) => {
                return Err(decode_error(format!(
                    "trigger {id}: {trigger_type} trigger without its config"
                )));
            }
        };

        Ok(Trigger {
            id,
            name: self.name,
            description: self.description,
            kind,
            is_active: self.is_active,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            last_triggered_at: self.last_triggered_at,
            next_run_at: self.next_run_at,
        })
    }
}

/// Splits the kind into the two nullable config columns.
fn config_columns(
    kind: &TriggerKind,
) -> Result<(Option<serde_json::Value>, Option<serde_json::Value>), TriggerError> {
    Ok(match kind {
        TriggerKind::Scheduled { schedule_config } => (
            Some(serde_json::to_value(schedule_config).map_err(storage)?),
            None,
        ),
        TriggerKind::Api { api_config } => {
            (None, Some(serde_json::to_value(api_config).map_err(storage)?))
        }
    })
}

fn storage(e: impl std::fmt::Display) -> TriggerError {
    TriggerError::StorageFailed {
        reason: e.to_string(),
    }
}

const SELECT_TRIGGER: &str = r#"
    SELECT id, name, description, trigger_type, schedule_config, api_config,
           is_active, is_deleted, created_at, updated_at, deleted_at,
           last_triggered_at, next_run_at
    FROM triggers
"#;

/// Trigger repository over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgTriggerRepository {
    pool: PgPool,
}

impl PgTriggerRepository {
    /// Creates a new repository.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerRepository for PgTriggerRepository {
    async fn create(&self, trigger: Trigger) -> Result<TriggerId, TriggerError> {
        let (schedule_config, api_config) = config_columns(&trigger.kind)?;

        sqlx::query(
            r#"
            INSERT INTO triggers
                (id, name, description, trigger_type, schedule_config, api_config,
                 is_active, is_deleted, created_at, updated_at, deleted_at,
                 last_triggered_at, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(trigger.id.to_string())
        .bind(&trigger.name)
        .bind(&trigger.description)
        .bind(trigger.trigger_type().as_str())
        .bind(&schedule_config)
        .bind(&api_config)
        .bind(trigger.is_active)
        .bind(trigger.is_deleted)
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .bind(trigger.deleted_at)
        .bind(trigger.last_triggered_at)
        .bind(trigger.next_run_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(trigger.id)
    }

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, TriggerError> {
        let row: Option<TriggerRow> =
            sqlx::query_as(&format!("{SELECT_TRIGGER} WHERE id = $1 AND NOT is_deleted"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

        row.map(TriggerRow::try_into_trigger)
            .transpose()
            .map_err(storage)
    }

    async fn list(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>, TriggerError> {
        let rows: Vec<TriggerRow> = sqlx::query_as(&format!(
            r#"{SELECT_TRIGGER}
            WHERE NOT is_deleted
              AND (NOT $1 OR is_active)
              AND ($2::text IS NULL OR trigger_type = $2)
            ORDER BY created_at, id
            "#
        ))
        .bind(filter.active_only)
        .bind(filter.trigger_type.map(TriggerType::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|r| r.try_into_trigger().map_err(storage))
            .collect()
    }

    async fn update(
        &self,
        id: TriggerId,
        patch: &TriggerPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, TriggerError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row: Option<TriggerRow> = sqlx::query_as(&format!(
            "{SELECT_TRIGGER} WHERE id = $1 AND NOT is_deleted FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;
        let Some(row) = row else {
            return Ok(false);
        };

        let mut trigger = row.try_into_trigger().map_err(storage)?;
        patch.apply(&mut trigger, now);
        let (schedule_config, api_config) = config_columns(&trigger.kind)?;

        sqlx::query(
            r#"
            UPDATE triggers
            SET name = $2, description = $3, schedule_config = $4, api_config = $5,
                is_active = $6, updated_at = $7, last_triggered_at = $8, next_run_at = $9
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(&trigger.name)
        .bind(&trigger.description)
        .bind(&schedule_config)
        .bind(&api_config)
        .bind(trigger.is_active)
        .bind(trigger.updated_at)
        .bind(trigger.last_triggered_at)
        .bind(trigger.next_run_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(true)
    }

    async fn soft_delete(&self, id: TriggerId, now: DateTime<Utc>) -> Result<bool, TriggerError> {
        let result = sqlx::query(
            r#"
            UPDATE triggers
            SET is_deleted = TRUE, is_active = FALSE, deleted_at = $2, updated_at = $2,
                next_run_at = NULL
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }
}
