//! Execution events and per-trigger statistics.

use crate::retention::RetentionPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use trigger_relay_core::{EventId, TriggerId};
use trigger_relay_trigger::TriggerType;

/// Outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failed,
}

impl EventStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status '{other}'")),
        }
    }
}

/// Where an event is in its lifecycle. Purged events no longer exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionState {
    Active,
    Archived,
}

impl RetentionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for RetentionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown retention state '{other}'")),
        }
    }
}

/// Immutable record of one execution attempt.
///
/// Only the retention fields (`retention_state`, `archived_at`) change after
/// creation, and only forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Trigger that fired. The trigger may since have been deleted.
    pub trigger_id: TriggerId,
    /// Trigger name at execution time.
    pub trigger_name: String,
    /// Trigger type at execution time.
    pub trigger_type: TriggerType,
    pub status: EventStatus,
    pub execution_time: DateTime<Utc>,
    pub is_test: bool,
    pub is_manual: bool,
    #[serde(default)]
    pub request_payload: Option<Value>,
    #[serde(default)]
    pub response_data: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub retention_state: RetentionState,
    pub created_at: DateTime<Utc>,
    pub archive_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

/// The execution-specific part of an event, before it is stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub trigger_id: TriggerId,
    pub trigger_name: String,
    pub trigger_type: TriggerType,
    pub status: EventStatus,
    pub is_test: bool,
    pub is_manual: bool,
    pub request_payload: Option<Value>,
    pub response_data: Option<Value>,
    pub error_message: Option<String>,
}

impl NewEvent {
    /// A successful event with no request or response data.
    #[must_use]
    pub fn success(trigger_id: TriggerId, trigger_name: &str, trigger_type: TriggerType) -> Self {
        Self {
            trigger_id,
            trigger_name: trigger_name.to_string(),
            trigger_type,
            status: EventStatus::Success,
            is_test: false,
            is_manual: false,
            request_payload: None,
            response_data: None,
            error_message: None,
        }
    }

    /// Stamps the event as created at `at`, with retention deadlines from
    /// `policy`.
    #[must_use]
    pub fn into_event(self, at: DateTime<Utc>, policy: &RetentionPolicy) -> Event {
        Event {
            id: EventId::new(),
            trigger_id: self.trigger_id,
            trigger_name: self.trigger_name,
            trigger_type: self.trigger_type,
            status: self.status,
            execution_time: at,
            is_test: self.is_test,
            is_manual: self.is_manual,
            request_payload: self.request_payload,
            response_data: self.response_data,
            error_message: self.error_message,
            retention_state: RetentionState::Active,
            created_at: at,
            archive_time: at + policy.archive_after(),
            expiry_time: at + policy.expire_after(),
            archived_at: None,
        }
    }
}

/// Execution counts for one trigger within a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub trigger_id: TriggerId,
    pub trigger_name: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub test_executions: u64,
    pub manual_executions: u64,
    pub last_execution: DateTime<Utc>,
}

impl EventStats {
    /// Groups `events` by trigger. Most recently executed triggers first.
    #[must_use]
    pub fn collect<'a>(events: impl IntoIterator<Item = &'a Event>) -> Vec<Self> {
        let mut by_trigger: HashMap<TriggerId, Self> = HashMap::new();
        for event in events {
            let stats = by_trigger
                .entry(event.trigger_id)
                .or_insert_with(|| Self {
                    trigger_id: event.trigger_id,
                    trigger_name: event.trigger_name.clone(),
                    total_executions: 0,
                    successful_executions: 0,
                    failed_executions: 0,
                    test_executions: 0,
                    manual_executions: 0,
                    last_execution: event.execution_time,
                });

            stats.total_executions += 1;
            match event.status {
                EventStatus::Success => stats.successful_executions += 1,
                EventStatus::Failed => stats.failed_executions += 1,
            }
            stats.test_executions += u64::from(event.is_test);
            stats.manual_executions += u64::from(event.is_manual);
            if event.execution_time > stats.last_execution {
                stats.last_execution = event.execution_time;
                stats.trigger_name.clone_from(&event.trigger_name);
            }
        }

        let mut stats: Vec<Self> = by_trigger.into_values().collect();
        stats.sort_by(|a, b| {
            b.last_execution
                .cmp(&a.last_execution)
                .then(a.trigger_id.cmp(&b.trigger_id))
        });
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn retention_deadlines_are_exact_offsets() {
        let event = NewEvent::success(TriggerId::new(), "t", TriggerType::Scheduled)
            .into_event(now(), &RetentionPolicy::default());

        assert_eq!(event.created_at, now());
        assert_eq!(event.archive_time, now() + Duration::hours(2));
        assert_eq!(event.expiry_time, now() + Duration::hours(48));
        assert!(event.archive_time < event.expiry_time);
        assert_eq!(event.retention_state, RetentionState::Active);
        assert_eq!(event.archived_at, None);
    }

    #[test]
    fn stats_group_by_trigger() {
        let policy = RetentionPolicy::default();
        let a = TriggerId::new();
        let b = TriggerId::new();

        let mut failed = NewEvent::success(a, "a", TriggerType::Api);
        failed.status = EventStatus::Failed;
        failed.is_manual = true;
        let mut test = NewEvent::success(a, "a-renamed", TriggerType::Api);
        test.is_test = true;

        let events = vec![
            NewEvent::success(a, "a", TriggerType::Api).into_event(now(), &policy),
            failed.into_event(now() + Duration::minutes(1), &policy),
            test.into_event(now() + Duration::minutes(2), &policy),
            NewEvent::success(b, "b", TriggerType::Scheduled)
                .into_event(now() - Duration::hours(1), &policy),
        ];

        let stats = EventStats::collect(&events);
        assert_eq!(stats.len(), 2);

        let first = &stats[0];
        assert_eq!(first.trigger_id, a);
        assert_eq!(first.trigger_name, "a-renamed");
        assert_eq!(first.total_executions, 3);
        assert_eq!(first.successful_executions, 2);
        assert_eq!(first.failed_executions, 1);
        assert_eq!(first.test_executions, 1);
        assert_eq!(first.manual_executions, 1);
        assert_eq!(first.last_execution, now() + Duration::minutes(2));

        assert_eq!(stats[1].trigger_id, b);
        assert_eq!(stats[1].total_executions, 1);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(EventStatus::Failed).expect("serialize");
        assert_eq!(json, serde_json::json!("failed"));
        assert_eq!("archived".parse(), Ok(RetentionState::Archived));
    }
}
