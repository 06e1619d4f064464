//! Event store contract and an in-memory implementation.

use crate::error::EventStoreError;
use crate::event::{Event, RetentionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use trigger_relay_core::{EventId, TriggerId};

/// Event lookup criteria. Unset fields do not filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub retention_state: Option<RetentionState>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
    pub trigger_id: Option<TriggerId>,
}

impl EventQuery {
    /// Whether `event` satisfies the query.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.retention_state
            .is_none_or(|state| state == event.retention_state)
            && self.created_after.is_none_or(|t| event.created_at >= t)
            && self.created_before.is_none_or(|t| event.created_at < t)
            && self.trigger_id.is_none_or(|id| id == event.trigger_id)
    }
}

/// Durable storage for execution events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Stores a new event.
    async fn create(&self, event: Event) -> Result<EventId, EventStoreError>;

    /// Finds events matching the query, newest first.
    async fn find(&self, query: &EventQuery) -> Result<Vec<Event>, EventStoreError>;

    /// Moves an event from `from` to `to`, stamping `archived_at` with `at`
    /// when archiving. A no-op returning `false` when the event is absent or
    /// not in `from`.
    async fn update_retention_state(
        &self,
        id: EventId,
        from: RetentionState,
        to: RetentionState,
        at: DateTime<Utc>,
    ) -> Result<bool, EventStoreError>;

    /// Deletes every event created before `cutoff`, in any state. Returns the
    /// number deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventStoreError>;
}

/// In-memory store for tests and database-less deployments.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<EventId, Event>>,
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one event, bypassing any retention window.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<Event> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create(&self, event: Event) -> Result<EventId, EventStoreError> {
        let id = event.id;
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, event);
        Ok(id)
    }

    async fn find(&self, query: &EventQuery) -> Result<Vec<Event>, EventStoreError> {
        let mut events: Vec<Event> = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(events)
    }

    async fn update_retention_state(
        &self,
        id: EventId,
        from: RetentionState,
        to: RetentionState,
        at: DateTime<Utc>,
    ) -> Result<bool, EventStoreError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        match events.get_mut(&id) {
            Some(event) if event.retention_state == from => {
                event.retention_state = to;
                if to == RetentionState::Archived {
                    event.archived_at = Some(at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventStoreError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let before = events.len();
        events.retain(|_, e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}
