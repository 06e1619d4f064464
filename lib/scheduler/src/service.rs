//! The outward service used by the HTTP layer.

use crate::error::ServiceError;
use crate::executor::ExecutionContext;
use crate::scheduler::JobScheduler;
use chrono::{DateTime, Duration, Utc};
use rootcause::Report;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};
use trigger_relay_core::{Clock, TriggerId};
use trigger_relay_events::{Event, EventStats, RetentionEngine};
use trigger_relay_trigger::{
    NewTrigger, Trigger, TriggerFilter, TriggerKind, TriggerPatch, TriggerRepository,
    TriggerType, ValidationError,
};

/// Result of testing a trigger definition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    /// API definitions run immediately.
    Executed { event: Box<Event> },
    /// Scheduled definitions are armed once under a throwaway id.
    Scheduled {
        trigger_id: TriggerId,
        due_at: DateTime<Utc>,
    },
}

fn persistence(e: impl std::fmt::Display) -> Report<ServiceError> {
    ServiceError::Persistence {
        reason: e.to_string(),
    }
    .into()
}

fn invalid(error: ValidationError) -> Report<ServiceError> {
    ServiceError::Validation { error }.into()
}

/// Trigger and event operations.
#[derive(Clone)]
pub struct TriggerService {
    triggers: Arc<dyn TriggerRepository>,
    scheduler: JobScheduler,
    retention: RetentionEngine,
    clock: Arc<dyn Clock>,
}

impl TriggerService {
    #[must_use]
    pub fn new(
        triggers: Arc<dyn TriggerRepository>,
        scheduler: JobScheduler,
        retention: RetentionEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            triggers,
            scheduler,
            retention,
            clock,
        }
    }

    /// Validates, stores and (for scheduled triggers) arms a new trigger.
    ///
    /// # Errors
    ///
    /// `Validation` for a rejected definition, `Persistence` when the
    /// repository fails.
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    pub async fn create_trigger(
        &self,
        definition: NewTrigger,
    ) -> Result<Trigger, Report<ServiceError>> {
        let now = self.clock.now();
        definition.validate(now).map_err(invalid)?;

        let mut trigger = definition.into_trigger(now);
        self.triggers
            .create(trigger.clone())
            .await
            .map_err(persistence)?;
        trigger.next_run_at = self.scheduler.schedule(&trigger).await.map_err(persistence)?;

        info!(trigger_id = %trigger.id, trigger_type = %trigger.trigger_type(), "trigger created");
        Ok(trigger)
    }

    /// Applies a partial update and re-arms the trigger.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown trigger, `Inactive` when the trigger is
    /// inactive and the patch does not re-activate it, `Validation` for a
    /// rejected patch.
    #[instrument(skip(self, patch), fields(trigger_id = %id))]
    pub async fn update_trigger(
        &self,
        id: TriggerId,
        patch: TriggerPatch,
    ) -> Result<Trigger, Report<ServiceError>> {
        let now = self.clock.now();
        let existing = self.require(id).await?;
        if !existing.is_active && !patch.reactivates() {
            return Err(ServiceError::Inactive { id }.into());
        }
        patch.validate_against(&existing, now).map_err(invalid)?;

        let updated = self
            .triggers
            .update(id, &patch, now)
            .await
            .map_err(persistence)?;
        if !updated {
            return Err(ServiceError::NotFound { id }.into());
        }

        let mut trigger = self.require(id).await?;
        trigger.next_run_at = self.scheduler.schedule(&trigger).await.map_err(persistence)?;
        info!(is_active = trigger.is_active, "trigger updated");
        Ok(trigger)
    }

    /// Soft-deletes a trigger and disarms it.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or already deleted trigger.
    #[instrument(skip(self), fields(trigger_id = %id))]
    pub async fn delete_trigger(&self, id: TriggerId) -> Result<(), Report<ServiceError>> {
        let deleted = self
            .triggers
            .soft_delete(id, self.clock.now())
            .await
            .map_err(persistence)?;
        if !deleted {
            return Err(ServiceError::NotFound { id }.into());
        }
        self.scheduler.cancel(id);
        info!("trigger deleted");
        Ok(())
    }

    /// Executes an active trigger now, optionally overriding its payload.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Inactive`, `Validation` for a payload that does not fit
    /// the trigger, `Persistence` when the event cannot be stored.
    #[instrument(skip(self, payload), fields(trigger_id = %id))]
    pub async fn execute_trigger_now(
        &self,
        id: TriggerId,
        payload: Option<Map<String, Value>>,
    ) -> Result<Event, Report<ServiceError>> {
        let trigger = self.require(id).await?;
        if !trigger.is_active {
            return Err(ServiceError::Inactive { id }.into());
        }
        check_payload(&trigger, payload.as_ref())?;

        self.scheduler
            .fire_now(&trigger, ExecutionContext::manual(payload))
            .await
            .map_err(persistence)
    }

    /// Tests a definition without registering it.
    ///
    /// API definitions are executed immediately. Scheduled definitions are
    /// armed once as a one-time job. Either way the event is marked as a
    /// test.
    ///
    /// # Errors
    ///
    /// `Validation` for a rejected definition or payload, `Persistence` when
    /// the event cannot be stored.
    #[instrument(skip(self, definition, payload), fields(name = %definition.name))]
    pub async fn test_trigger(
        &self,
        definition: NewTrigger,
        payload: Option<Map<String, Value>>,
    ) -> Result<TestOutcome, Report<ServiceError>> {
        let now = self.clock.now();
        definition.validate(now).map_err(invalid)?;

        let mut trigger = definition.into_trigger(now);
        trigger.is_active = true;
        check_payload(&trigger, payload.as_ref())?;

        if let Some(schedule_config) = trigger.schedule().map(|c| c.as_one_time(now)) {
            trigger.kind = TriggerKind::Scheduled { schedule_config };
            let trigger_id = trigger.id;
            let due_at = self
                .scheduler
                .schedule_ephemeral(trigger)
                .unwrap_or(now);
            info!(%trigger_id, %due_at, "test trigger armed");
            return Ok(TestOutcome::Scheduled { trigger_id, due_at });
        }

        let event = self
            .scheduler
            .fire_now(&trigger, ExecutionContext::test(payload))
            .await
            .map_err(persistence)?;
        Ok(TestOutcome::Executed {
            event: Box::new(event),
        })
    }

    /// Gets a trigger.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or deleted trigger.
    pub async fn get_trigger(&self, id: TriggerId) -> Result<Trigger, Report<ServiceError>> {
        self.require(id).await
    }

    /// Lists non-deleted triggers.
    ///
    /// # Errors
    ///
    /// `Persistence` when the repository fails.
    pub async fn list_triggers(
        &self,
        active_only: bool,
    ) -> Result<Vec<Trigger>, Report<ServiceError>> {
        let filter = TriggerFilter {
            active_only,
            trigger_type: None,
        };
        self.triggers.list(&filter).await.map_err(persistence)
    }

    /// Active events within `window`.
    ///
    /// # Errors
    ///
    /// `Persistence` when the event store fails.
    pub async fn get_recent_events(
        &self,
        window: Option<Duration>,
    ) -> Result<Vec<Event>, Report<ServiceError>> {
        self.retention.recent(window).await.map_err(persistence)
    }

    /// Archived events within `window`.
    ///
    /// # Errors
    ///
    /// `Persistence` when the event store fails.
    pub async fn get_archived_events(
        &self,
        window: Option<Duration>,
    ) -> Result<Vec<Event>, Report<ServiceError>> {
        self.retention.archived(window).await.map_err(persistence)
    }

    /// Per-trigger statistics within `window`.
    ///
    /// # Errors
    ///
    /// `Persistence` when the event store fails.
    pub async fn get_event_stats(
        &self,
        window: Option<Duration>,
    ) -> Result<Vec<EventStats>, Report<ServiceError>> {
        self.retention.stats(window).await.map_err(persistence)
    }

    async fn require(&self, id: TriggerId) -> Result<Trigger, Report<ServiceError>> {
        self.triggers
            .get(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| ServiceError::NotFound { id }.into())
    }
}

fn check_payload(
    trigger: &Trigger,
    payload: Option<&Map<String, Value>>,
) -> Result<(), Report<ServiceError>> {
    let Some(payload) = payload else {
        return Ok(());
    };
    match trigger.api() {
        Some(api) => api
            .resolve_payload(Some(payload.clone()))
            .map(drop)
            .map_err(invalid),
        None => Err(invalid(ValidationError::PayloadNotAccepted {
            trigger_type: TriggerType::Scheduled,
        })),
    }
}

impl std::fmt::Debug for TriggerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerService")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
