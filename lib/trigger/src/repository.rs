//! Trigger repository contract and an in-memory implementation.

use crate::error::TriggerError;
use crate::trigger::{Trigger, TriggerPatch, TriggerType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use trigger_relay_core::TriggerId;

/// Filter for listing triggers. Soft-deleted triggers are never listed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerFilter {
    /// Only triggers with `is_active`.
    pub active_only: bool,
    /// Only triggers of this type.
    pub trigger_type: Option<TriggerType>,
}

impl TriggerFilter {
    /// Active scheduled triggers: what the scheduler arms on start.
    #[must_use]
    pub const fn armable() -> Self {
        Self {
            active_only: true,
            trigger_type: Some(TriggerType::Scheduled),
        }
    }

    /// Whether `trigger` passes the filter.
    #[must_use]
    pub fn matches(&self, trigger: &Trigger) -> bool {
        !trigger.is_deleted
            && (!self.active_only || trigger.is_active)
            && self
                .trigger_type
                .is_none_or(|t| t == trigger.trigger_type())
    }
}

/// Durable storage for trigger definitions.
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    /// Stores a new trigger.
    async fn create(&self, trigger: Trigger) -> Result<TriggerId, TriggerError>;

    /// Gets a trigger. Soft-deleted triggers are reported as absent.
    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, TriggerError>;

    /// Lists triggers matching the filter, oldest first.
    async fn list(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>, TriggerError>;

    /// Applies a patch. Returns `false` when the trigger is absent or deleted.
    async fn update(
        &self,
        id: TriggerId,
        patch: &TriggerPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, TriggerError>;

    /// Marks a trigger deleted and inactive. Returns `false` when the trigger
    /// is absent or already deleted.
    async fn soft_delete(&self, id: TriggerId, now: DateTime<Utc>) -> Result<bool, TriggerError>;
}

/// In-memory repository for tests and database-less deployments.
#[derive(Debug, Default)]
pub struct InMemoryTriggerRepository {
    triggers: RwLock<HashMap<TriggerId, Trigger>>,
}

impl InMemoryTriggerRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a trigger regardless of its deleted flag.
    #[must_use]
    pub fn get_raw(&self, id: TriggerId) -> Option<Trigger> {
        self.triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

#[async_trait]
impl TriggerRepository for InMemoryTriggerRepository {
    async fn create(&self, trigger: Trigger) -> Result<TriggerId, TriggerError> {
        let id = trigger.id;
        self.triggers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, trigger);
        Ok(id)
    }

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, TriggerError> {
        Ok(self.get_raw(id).filter(|t| !t.is_deleted))
    }

    async fn list(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>, TriggerError> {
        let mut triggers: Vec<Trigger> = self
            .triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        triggers.sort_by_key(|t| (t.created_at, t.id));
        Ok(triggers)
    }

    async fn update(
        &self,
        id: TriggerId,
        patch: &TriggerPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, TriggerError> {
        let mut triggers = self.triggers.write().unwrap_or_else(PoisonError::into_inner);
        match triggers.get_mut(&id) {
            Some(trigger) if !trigger.is_deleted => {
                patch.apply(trigger, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, id: TriggerId, now: DateTime<Utc>) -> Result<bool, TriggerError> {
        let mut triggers = self.triggers.write().unwrap_or_else(PoisonError::into_inner);
        match triggers.get_mut(&id) {
            Some(trigger) if !trigger.is_deleted => {
                trigger.is_deleted = true;
                trigger.is_active = false;
                trigger.deleted_at = Some(now);
                trigger.updated_at = now;
                trigger.next_run_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
