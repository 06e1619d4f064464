//! Shared fixtures for the scheduler tests.

use crate::error::CallError;
use crate::executor::{ApiCaller, ApiRequest, ApiResponse};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use trigger_relay_core::{EventId, TriggerId};
use trigger_relay_events::{
    Event, EventQuery, EventStore, EventStoreError, InMemoryEventStore, RetentionState,
};
use trigger_relay_trigger::{
    ApiConfig, IntervalUnit, NewTrigger, ScheduleConfig, Trigger, TriggerKind,
};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
}

pub fn scheduled_trigger(name: &str) -> Trigger {
    scheduled_with(
        name,
        ScheduleConfig::RecurringInterval {
            unit: IntervalUnit::Minutes,
            value: 5,
        },
    )
}

pub fn scheduled_with(name: &str, schedule_config: ScheduleConfig) -> Trigger {
    NewTrigger::new(name, TriggerKind::Scheduled { schedule_config }).into_trigger(epoch())
}

pub fn api_trigger(name: &str, api_config: ApiConfig) -> Trigger {
    NewTrigger::new(name, TriggerKind::Api { api_config }).into_trigger(epoch())
}

/// Caller that returns a fixed outcome and records what it was sent.
pub struct ScriptedCaller {
    outcome: Result<Value, CallError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedCaller {
    pub fn ok(body: Value) -> Self {
        Self::with_outcome(Ok(body))
    }

    pub fn failing(error: CallError) -> Self {
        Self::with_outcome(Err(error))
    }

    /// Succeeds after holding each call open for `delay` of real time.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::ok(Value::Null)
        }
    }

    fn with_outcome(outcome: Result<Value, CallError>) -> Self {
        Self {
            outcome,
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ApiRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ApiCaller for ScriptedCaller {
    async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, CallError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.outcome.clone().map(|body| ApiResponse { status: 200, body })
    }
}

/// Event store that is always down.
pub struct FailingEventStore;

#[async_trait]
impl EventStore for FailingEventStore {
    async fn create(&self, _event: Event) -> Result<EventId, EventStoreError> {
        Err(EventStoreError::StorageFailed {
            reason: "connection refused".to_string(),
        })
    }

    async fn find(&self, _query: &EventQuery) -> Result<Vec<Event>, EventStoreError> {
        Ok(Vec::new())
    }

    async fn update_retention_state(
        &self,
        _id: EventId,
        _from: RetentionState,
        _to: RetentionState,
        _at: DateTime<Utc>,
    ) -> Result<bool, EventStoreError> {
        Ok(false)
    }

    async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, EventStoreError> {
        Ok(0)
    }
}

/// In-memory store whose writes take `delay` of real time, recording how
/// many were in progress at once.
pub struct SlowEventStore {
    inner: Arc<InMemoryEventStore>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowEventStore {
    pub fn new(inner: Arc<InMemoryEventStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for SlowEventStore {
    async fn create(&self, event: Event) -> Result<EventId, EventStoreError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.create(event).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn find(&self, query: &EventQuery) -> Result<Vec<Event>, EventStoreError> {
        self.inner.find(query).await
    }

    async fn update_retention_state(
        &self,
        id: EventId,
        from: RetentionState,
        to: RetentionState,
        at: DateTime<Utc>,
    ) -> Result<bool, EventStoreError> {
        self.inner.update_retention_state(id, from, to, at).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventStoreError> {
        self.inner.delete_older_than(cutoff).await
    }
}

/// Polls `condition` in real time until it holds, panicking after 5s.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Events recorded for `trigger_id`, newest first.
pub async fn events_for(store: &dyn EventStore, trigger_id: TriggerId) -> Vec<Event> {
    store
        .find(&EventQuery {
            trigger_id: Some(trigger_id),
            ..EventQuery::default()
        })
        .await
        .unwrap()
}
