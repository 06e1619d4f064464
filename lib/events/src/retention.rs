//! Event retention: `active → archived → purged`.
//!
//! Two mechanisms cooperate. Every new event gets a one-shot archive timer at
//! its `archive_time`, and periodic sweeps archive and purge whatever the
//! timers missed (events created before a restart, lost timers). Both go
//! through the store's conditional update, so they commute.

use crate::error::EventStoreError;
use crate::event::{Event, EventStats, RetentionState};
use crate::store::{EventQuery, EventStore};
use chrono::{DateTime, Duration, Utc};
use rootcause::Report;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use trigger_relay_core::{EventId, TimerSource, TimerToken};

fn default_archive_after_minutes() -> u64 {
    120
}

fn default_expire_after_hours() -> u64 {
    48
}

fn default_archive_sweep_seconds() -> u64 {
    900
}

fn default_cleanup_sweep_seconds() -> u64 {
    3600
}

fn duration_or_max(value: u64, unit: fn(i64) -> Option<Duration>) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(unit)
        .unwrap_or(Duration::MAX)
}

/// Longest accepted retention duration: one hundred years.
fn retention_horizon() -> Duration {
    Duration::days(36_500)
}

/// Retention timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Age at which an event is archived.
    #[serde(default = "default_archive_after_minutes")]
    pub archive_after_minutes: u64,
    /// Age at which an event is purged.
    #[serde(default = "default_expire_after_hours")]
    pub expire_after_hours: u64,
    #[serde(default = "default_archive_sweep_seconds")]
    pub archive_sweep_seconds: u64,
    #[serde(default = "default_cleanup_sweep_seconds")]
    pub cleanup_sweep_seconds: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            archive_after_minutes: default_archive_after_minutes(),
            expire_after_hours: default_expire_after_hours(),
            archive_sweep_seconds: default_archive_sweep_seconds(),
            cleanup_sweep_seconds: default_cleanup_sweep_seconds(),
        }
    }
}

impl RetentionPolicy {
    #[must_use]
    pub fn archive_after(&self) -> Duration {
        duration_or_max(self.archive_after_minutes, Duration::try_minutes)
    }

    #[must_use]
    pub fn expire_after(&self) -> Duration {
        duration_or_max(self.expire_after_hours, Duration::try_hours)
    }

    #[must_use]
    pub fn archive_sweep(&self) -> Duration {
        duration_or_max(self.archive_sweep_seconds, Duration::try_seconds)
    }

    #[must_use]
    pub fn cleanup_sweep(&self) -> Duration {
        duration_or_max(self.cleanup_sweep_seconds, Duration::try_seconds)
    }

    /// Events must be archived strictly before they expire, sweeps need a
    /// positive period. No duration may exceed one hundred years, so event
    /// timestamps stay on the calendar.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let horizon = retention_horizon();
        let within = |d: Duration| d > Duration::zero() && d <= horizon;
        within(self.archive_after())
            && within(self.expire_after())
            && within(self.archive_sweep())
            && within(self.cleanup_sweep())
            && self.archive_after() < self.expire_after()
    }

    /// Clamps a requested look-back window to what retention keeps.
    #[must_use]
    pub fn clamp_window(&self, window: Duration) -> Duration {
        window.clamp(Duration::zero(), self.expire_after())
    }
}

/// Drives event retention on top of an [`EventStore`] and the shared
/// [`TimerSource`].
#[derive(Clone)]
pub struct RetentionEngine {
    store: Arc<dyn EventStore>,
    timers: TimerSource,
    policy: RetentionPolicy,
}

impl RetentionEngine {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, timers: TimerSource, policy: RetentionPolicy) -> Self {
        Self {
            store,
            timers,
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    fn now(&self) -> DateTime<Utc> {
        self.timers.clock().now()
    }

    /// Arms the per-event archive timer for a freshly stored event.
    pub fn track(&self, event: &Event) {
        if event.retention_state != RetentionState::Active {
            return;
        }
        self.timers
            .schedule_at(event.archive_time, TimerToken::ArchiveEvent(event.id));
    }

    /// Archives one event if it is still active.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn archive_event(&self, id: EventId) -> Result<bool, Report<EventStoreError>> {
        let archived = self
            .store
            .update_retention_state(
                id,
                RetentionState::Active,
                RetentionState::Archived,
                self.now(),
            )
            .await?;
        if archived {
            debug!(event_id = %id, "event archived");
        }
        Ok(archived)
    }

    /// Archives every active event older than the archive age. Returns how
    /// many events this call archived.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    #[instrument(skip(self))]
    pub async fn archive_events(&self) -> Result<u64, Report<EventStoreError>> {
        let now = self.now();
        let due = self
            .store
            .find(&EventQuery {
                retention_state: Some(RetentionState::Active),
                created_before: Some(now - self.policy.archive_after()),
                ..EventQuery::default()
            })
            .await?;

        let mut archived = 0;
        for event in due {
            if self
                .store
                .update_retention_state(
                    event.id,
                    RetentionState::Active,
                    RetentionState::Archived,
                    now,
                )
                .await?
            {
                archived += 1;
            }
            self.timers.cancel(TimerToken::ArchiveEvent(event.id));
        }

        if archived > 0 {
            info!(archived, "archive sweep complete");
        }
        Ok(archived)
    }

    /// Purges every event older than the expiry age, in any state. Returns
    /// how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    #[instrument(skip(self))]
    pub async fn cleanup_events(&self) -> Result<u64, Report<EventStoreError>> {
        let cutoff = self.now() - self.policy.expire_after();
        let deleted = self.store.delete_older_than(cutoff).await?;
        if deleted > 0 {
            info!(deleted, %cutoff, "expired events purged");
        }
        Ok(deleted)
    }

    /// Runs both sweeps once, then arms their periodic timers.
    ///
    /// A failing startup sweep is logged; the periodic sweep retries it.
    pub async fn start(&self) {
        if let Err(report) = self.archive_events().await {
            warn!(error = %report, "startup archive sweep failed");
        }
        if let Err(report) = self.cleanup_events().await {
            warn!(error = %report, "startup cleanup sweep failed");
        }

        self.timers
            .schedule_interval(self.policy.archive_sweep(), TimerToken::ArchiveSweep);
        self.timers
            .schedule_interval(self.policy.cleanup_sweep(), TimerToken::CleanupSweep);
    }

    /// Runs the job behind a retention timer. Other tokens are ignored.
    pub async fn on_timer(&self, token: TimerToken) {
        let outcome = match token {
            TimerToken::ArchiveEvent(id) => self.archive_event(id).await.map(u64::from),
            TimerToken::ArchiveSweep => self.archive_events().await,
            TimerToken::CleanupSweep => self.cleanup_events().await,
            TimerToken::Trigger(_) => return,
        };
        if let Err(report) = outcome {
            warn!(%token, error = %report, "retention job failed");
        }
    }

    /// Active events created within `window` (default: the archive age).
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn recent(
        &self,
        window: Option<Duration>,
    ) -> Result<Vec<Event>, Report<EventStoreError>> {
        let window = self
            .policy
            .clamp_window(window.unwrap_or_else(|| self.policy.archive_after()));
        let events = self
            .store
            .find(&EventQuery {
                retention_state: Some(RetentionState::Active),
                created_after: Some(self.now() - window),
                ..EventQuery::default()
            })
            .await?;
        Ok(events)
    }

    /// Archived events created within `window` (default and maximum: the
    /// expiry age).
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn archived(
        &self,
        window: Option<Duration>,
    ) -> Result<Vec<Event>, Report<EventStoreError>> {
        let window = self
            .policy
            .clamp_window(window.unwrap_or_else(|| self.policy.expire_after()));
        let events = self
            .store
            .find(&EventQuery {
                retention_state: Some(RetentionState::Archived),
                created_after: Some(self.now() - window),
                ..EventQuery::default()
            })
            .await?;
        Ok(events)
    }

    /// Per-trigger statistics for events created within `window`.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn stats(
        &self,
        window: Option<Duration>,
    ) -> Result<Vec<EventStats>, Report<EventStoreError>> {
        let window = self
            .policy
            .clamp_window(window.unwrap_or_else(|| self.policy.expire_after()));
        let events = self
            .store
            .find(&EventQuery {
                created_after: Some(self.now() - window),
                ..EventQuery::default()
            })
            .await?;
        Ok(EventStats::collect(&events))
    }
}

impl std::fmt::Debug for RetentionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionEngine")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use crate::store::InMemoryEventStore;
    use chrono::TimeZone;
    use trigger_relay_core::{Clock, FakeClock, TimerFire, TriggerId};
    use trigger_relay_trigger::TriggerType;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        clock: FakeClock,
        store: Arc<InMemoryEventStore>,
        retention: RetentionEngine,
        timers: TimerSource,
        fires: UnboundedReceiver<TimerFire>,
    }

    fn harness() -> Harness {
        let clock = FakeClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap());
        let (timers, fires) = TimerSource::new(Arc::new(clock.clone()));
        let store = Arc::new(InMemoryEventStore::new());
        let retention = RetentionEngine::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            timers.clone(),
            RetentionPolicy::default(),
        );
        Harness {
            clock,
            store,
            retention,
            timers,
            fires,
        }
    }

    async fn insert_aged(h: &Harness, age: Duration) -> EventId {
        let event = NewEvent::success(TriggerId::new(), "t", TriggerType::Scheduled)
            .into_event(h.clock.now() - age, h.retention.policy());
        h.store.create(event).await.unwrap()
    }

    #[tokio::test]
    async fn archive_sweep_archives_three_hour_old_event() {
        let h = harness();
        let old = insert_aged(&h, Duration::hours(3)).await;
        let fresh = insert_aged(&h, Duration::minutes(30)).await;

        assert_eq!(h.retention.archive_events().await.unwrap(), 1);

        let archived = h.store.get(old).unwrap();
        assert_eq!(archived.retention_state, RetentionState::Archived);
        assert_eq!(archived.archived_at, Some(h.clock.now()));
        assert_eq!(
            h.store.get(fresh).unwrap().retention_state,
            RetentionState::Active
        );
    }

    #[tokio::test]
    async fn archive_sweep_is_idempotent() {
        let h = harness();
        let id = insert_aged(&h, Duration::hours(3)).await;

        assert_eq!(h.retention.archive_events().await.unwrap(), 1);
        let first = h.store.get(id).unwrap().archived_at;

        h.clock.advance(Duration::minutes(15));
        assert_eq!(h.retention.archive_events().await.unwrap(), 0);

        let event = h.store.get(id).unwrap();
        assert_eq!(event.retention_state, RetentionState::Archived);
        assert_eq!(event.archived_at, first);
    }

    #[tokio::test]
    async fn cleanup_purges_forty_nine_hour_old_event() {
        let h = harness();
        let old = insert_aged(&h, Duration::hours(49)).await;
        insert_aged(&h, Duration::hours(47)).await;

        assert_eq!(h.retention.cleanup_events().await.unwrap(), 1);

        let remaining = h.store.find(&EventQuery::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|e| e.id != old));
    }

    #[tokio::test]
    async fn reads_never_return_expired_events() {
        let h = harness();
        let expired = insert_aged(&h, Duration::hours(49)).await;
        h.store
            .update_retention_state(
                expired,
                RetentionState::Active,
                RetentionState::Archived,
                h.clock.now(),
            )
            .await
            .unwrap();
        let kept = insert_aged(&h, Duration::hours(5)).await;
        h.retention.archive_events().await.unwrap();

        let archived = h
            .retention
            .archived(Some(Duration::hours(1000)))
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, kept);

        let stats = h.retention.stats(None).await.unwrap();
        assert_eq!(stats.iter().map(|s| s.total_executions).sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn recent_defaults_to_archive_age() {
        let h = harness();
        let fresh = insert_aged(&h, Duration::minutes(10)).await;
        insert_aged(&h, Duration::minutes(150)).await;

        let recent = h.retention.recent(None).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, fresh);
    }

    #[tokio::test]
    async fn per_event_timer_archives_at_archive_time() {
        let mut h = harness();
        let event = NewEvent::success(TriggerId::new(), "t", TriggerType::Api)
            .into_event(h.clock.now(), h.retention.policy());
        h.store.create(event.clone()).await.unwrap();
        h.retention.track(&event);
        assert_eq!(
            h.timers.due_at(TimerToken::ArchiveEvent(event.id)),
            Some(event.archive_time)
        );

        while h.clock.pending_sleepers() == 0 {
            tokio::task::yield_now().await;
        }
        h.clock.advance(Duration::hours(2));

        let fire = h.fires.recv().await.expect("archive timer fires");
        assert!(h.timers.acknowledge(&fire));
        h.retention.on_timer(fire.token).await;

        let stored = h.store.get(event.id).unwrap();
        assert_eq!(stored.retention_state, RetentionState::Archived);
        assert_eq!(stored.archived_at, Some(event.archive_time));
    }

    #[tokio::test]
    async fn start_sweeps_then_arms_intervals() {
        let h = harness();
        let stale = insert_aged(&h, Duration::hours(3)).await;
        insert_aged(&h, Duration::hours(50)).await;

        h.retention.start().await;

        assert_eq!(h.store.len(), 1);
        assert_eq!(
            h.store.get(stale).unwrap().retention_state,
            RetentionState::Archived
        );
        assert_eq!(
            h.timers.due_at(TimerToken::ArchiveSweep),
            Some(h.clock.now() + Duration::minutes(15))
        );
        assert_eq!(
            h.timers.due_at(TimerToken::CleanupSweep),
            Some(h.clock.now() + Duration::hours(1))
        );
    }

    #[test]
    fn policy_defaults_and_clamp() {
        let policy = RetentionPolicy::default();
        assert!(policy.is_consistent());
        assert_eq!(policy.archive_after(), Duration::hours(2));
        assert_eq!(policy.clamp_window(Duration::hours(100)), Duration::hours(48));
        assert_eq!(policy.clamp_window(Duration::hours(-1)), Duration::zero());

        let inverted = RetentionPolicy {
            archive_after_minutes: 60 * 49,
            ..RetentionPolicy::default()
        };
        assert!(!inverted.is_consistent());
    }

    #[test]
    fn out_of_calendar_durations_are_inconsistent() {
        let endless = RetentionPolicy {
            expire_after_hours: u64::MAX,
            ..RetentionPolicy::default()
        };
        assert_eq!(endless.expire_after(), Duration::MAX);
        assert!(!endless.is_consistent());

        let beyond = RetentionPolicy {
            archive_after_minutes: 60,
            expire_after_hours: 24 * 36_501,
            ..RetentionPolicy::default()
        };
        assert!(!beyond.is_consistent());

        let longest = RetentionPolicy {
            expire_after_hours: 24 * 36_500,
            ..RetentionPolicy::default()
        };
        assert!(longest.is_consistent());

        let idle = RetentionPolicy {
            cleanup_sweep_seconds: 0,
            ..RetentionPolicy::default()
        };
        assert!(!idle.is_consistent());
    }
}
