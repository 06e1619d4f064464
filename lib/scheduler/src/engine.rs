//! Engine assembly and the owned dispatch task.
//!
//! [`Engine::new`] wires the executor, job scheduler, retention engine and
//! service around one [`TimerSource`]. [`Engine::start`] recovers armed
//! triggers, starts retention and spawns the dispatch loop that routes timer
//! fires. The returned [`EngineHandle`] owns that task and joins it on
//! shutdown.

use crate::executor::{ApiCaller, TriggerExecutor};
use crate::scheduler::JobScheduler;
use crate::service::TriggerService;
use chrono::Duration;
use rootcause::Report;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};
use trigger_relay_core::{Clock, TimerFire, TimerSource, TimerToken};
use trigger_relay_events::{EventStore, RetentionEngine, RetentionPolicy};
use trigger_relay_trigger::{TriggerError, TriggerRepository};

fn default_one_time_grace_seconds() -> u64 {
    60
}

fn default_http_timeout_seconds() -> u64 {
    30
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How late a missed one-time fire may still run.
    #[serde(default = "default_one_time_grace_seconds")]
    pub one_time_grace_seconds: u64,
    /// Timeout for outbound API calls.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            one_time_grace_seconds: default_one_time_grace_seconds(),
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

impl SchedulerSettings {
    #[must_use]
    pub fn grace(&self) -> Duration {
        i64::try_from(self.one_time_grace_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    #[must_use]
    pub const fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_seconds)
    }
}

/// A wired engine that has not started yet.
pub struct Engine {
    timers: TimerSource,
    fires: mpsc::UnboundedReceiver<TimerFire>,
    scheduler: JobScheduler,
    retention: RetentionEngine,
    service: TriggerService,
}

impl Engine {
    #[must_use]
    pub fn new(
        triggers: Arc<dyn TriggerRepository>,
        events: Arc<dyn EventStore>,
        caller: Arc<dyn ApiCaller>,
        clock: Arc<dyn Clock>,
        settings: &SchedulerSettings,
        policy: RetentionPolicy,
    ) -> Self {
        let (timers, fires) = TimerSource::new(Arc::clone(&clock));
        let executor = TriggerExecutor::new(
            caller,
            Arc::clone(&events),
            Arc::clone(&clock),
            policy.clone(),
        );
        let retention = RetentionEngine::new(events, timers.clone(), policy);
        let scheduler = JobScheduler::new(
            Arc::clone(&triggers),
            executor,
            retention.clone(),
            timers.clone(),
            settings.grace(),
        );
        let service = TriggerService::new(triggers, scheduler.clone(), retention.clone(), clock);

        Self {
            timers,
            fires,
            scheduler,
            retention,
            service,
        }
    }

    /// Re-arms persisted triggers, starts retention and spawns the dispatch
    /// loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the trigger repository cannot be read.
    pub async fn start(self) -> Result<EngineHandle, Report<TriggerError>> {
        let recovered = self.scheduler.recover().await?;
        self.retention.start().await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch(
            self.fires,
            shutdown_rx,
            self.timers.clone(),
            self.scheduler.clone(),
            self.retention,
        ));
        info!(recovered, "engine started");

        Ok(EngineHandle {
            service: self.service,
            scheduler: self.scheduler,
            timers: self.timers,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Routes timer fires until shutdown is signalled.
async fn dispatch(
    mut fires: mpsc::UnboundedReceiver<TimerFire>,
    mut shutdown: oneshot::Receiver<()>,
    timers: TimerSource,
    scheduler: JobScheduler,
    retention: RetentionEngine,
) {
    let mut jobs = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(fire) = fires.recv() => {
                if !timers.acknowledge(&fire) {
                    trace!(token = %fire.token, "stale timer fire dropped");
                    continue;
                }
                match fire.token {
                    TimerToken::Trigger(id) => scheduler.on_timer(id),
                    token => {
                        let retention = retention.clone();
                        jobs.spawn(async move { retention.on_timer(token).await });
                    }
                }
            }
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "retention job failed");
                }
            }
            else => break,
        }
    }

    timers.cancel_all();
    while jobs.join_next().await.is_some() {}
    debug!("dispatch loop stopped");
}

/// A running engine.
pub struct EngineHandle {
    service: TriggerService,
    scheduler: JobScheduler,
    timers: TimerSource,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    #[must_use]
    pub const fn service(&self) -> &TriggerService {
        &self.service
    }

    #[must_use]
    pub const fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Number of live timers, trigger and retention alike.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.timers.armed_count()
    }

    /// Stops the dispatch loop, cancels every timer and waits for in-flight
    /// executions and retention jobs.
    pub async fn shutdown(self) {
        // The loop may already have exited.
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "dispatch task failed");
        }
        self.scheduler.drain().await;
        info!("engine stopped");
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::service::TestOutcome;
    use crate::testing::{ScriptedCaller, epoch, events_for, eventually};
    use serde_json::{Map, json};
    use trigger_relay_core::FakeClock;
    use trigger_relay_events::{EventStatus, InMemoryEventStore, NewEvent, RetentionState};
    use trigger_relay_trigger::{
        ApiConfig, HttpMethod, InMemoryTriggerRepository, IntervalUnit, NewTrigger,
        PayloadFieldType, ScheduleConfig, TriggerKind, TriggerPatch, TriggerType,
        ValidationError,
    };

    struct Harness {
        clock: FakeClock,
        repo: Arc<InMemoryTriggerRepository>,
        events: Arc<InMemoryEventStore>,
        caller: Arc<ScriptedCaller>,
        handle: EngineHandle,
    }

    impl Harness {
        fn service(&self) -> &TriggerService {
            self.handle.service()
        }
    }

    async fn start_with(events: Arc<InMemoryEventStore>, repo: Arc<InMemoryTriggerRepository>) -> Harness {
        let clock = FakeClock::new(epoch());
        let caller = Arc::new(ScriptedCaller::ok(json!({"ok": true})));
        let engine = Engine::new(
            repo.clone(),
            events.clone(),
            caller.clone(),
            Arc::new(clock.clone()),
            &SchedulerSettings::default(),
            RetentionPolicy::default(),
        );
        let handle = engine.start().await.expect("engine starts");
        Harness {
            clock,
            repo,
            events,
            caller,
            handle,
        }
    }

    async fn start() -> Harness {
        start_with(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryTriggerRepository::new()),
        )
        .await
    }

    fn scheduled(name: &str, schedule_config: ScheduleConfig) -> NewTrigger {
        NewTrigger::new(name, TriggerKind::Scheduled { schedule_config })
    }

    fn hook(name: &str) -> NewTrigger {
        let mut config = ApiConfig::new("https://example.com/hook", HttpMethod::Post);
        config
            .payload_types
            .insert("user_id".to_string(), PayloadFieldType::Number);
        config.payload.insert("user_id".to_string(), json!(1));
        NewTrigger::new(name, TriggerKind::Api { api_config: config })
    }

    fn context_of<T: std::fmt::Debug>(result: Result<T, Report<ServiceError>>) -> ServiceError {
        result.expect_err("operation fails").current_context().clone()
    }

    #[tokio::test]
    async fn one_time_trigger_yields_exactly_one_active_event() {
        let h = start().await;
        let trigger = h
            .service()
            .create_trigger(scheduled(
                "in five",
                ScheduleConfig::OneTimeAt {
                    at: epoch() + Duration::minutes(5),
                },
            ))
            .await
            .unwrap();
        assert_eq!(trigger.next_run_at, Some(epoch() + Duration::minutes(5)));

        h.clock.advance(Duration::minutes(5));

        let events = Arc::clone(&h.events);
        let id = trigger.id;
        eventually("one-time event", || {
            let events = Arc::clone(&events);
            async move { events_for(events.as_ref(), id).await.len() == 1 }
        })
        .await;
        h.handle.scheduler().drain().await;

        let recorded = events_for(h.events.as_ref(), id).await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].retention_state, RetentionState::Active);
        assert_eq!(recorded[0].status, EventStatus::Success);
        assert!(!h.repo.get_raw(id).unwrap().is_active);
    }

    #[tokio::test]
    async fn recurring_interval_fires_are_spaced() {
        let h = start().await;
        let trigger = h
            .service()
            .create_trigger(scheduled(
                "every five",
                ScheduleConfig::RecurringInterval {
                    unit: IntervalUnit::Minutes,
                    value: 5,
                },
            ))
            .await
            .unwrap();
        let id = trigger.id;

        for fired in 1..=4 {
            h.clock.advance(Duration::minutes(5));
            let events = Arc::clone(&h.events);
            eventually("next recurring fire", || {
                let events = Arc::clone(&events);
                async move { events_for(events.as_ref(), id).await.len() == fired }
            })
            .await;
        }

        let mut times: Vec<_> = events_for(h.events.as_ref(), id)
            .await
            .into_iter()
            .map(|e| e.execution_time)
            .collect();
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::minutes(5));
        }
        assert_eq!(
            h.handle.scheduler().armed_at(id),
            Some(epoch() + Duration::minutes(25))
        );
    }

    #[tokio::test]
    async fn create_rejects_short_interval() {
        let h = start().await;
        let err = context_of(
            h.service()
                .create_trigger(scheduled(
                    "too often",
                    ScheduleConfig::RecurringInterval {
                        unit: IntervalUnit::Minutes,
                        value: 3,
                    },
                ))
                .await,
        );
        assert!(matches!(
            err,
            ServiceError::Validation {
                error: ValidationError::IntervalTooShort { minimum: 5, .. }
            }
        ));
        assert!(h.service().list_triggers(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_interval_beyond_calendar() {
        let h = start().await;
        let err = context_of(
            h.service()
                .create_trigger(scheduled(
                    "never",
                    ScheduleConfig::RecurringInterval {
                        unit: IntervalUnit::Days,
                        value: u32::MAX,
                    },
                ))
                .await,
        );
        assert!(matches!(
            err,
            ServiceError::Validation {
                error: ValidationError::IntervalTooLong { .. }
            }
        ));
        assert!(h.service().list_triggers(false).await.unwrap().is_empty());
        assert_eq!(h.handle.scheduler().armed_count(), 0);
    }

    #[tokio::test]
    async fn update_requires_active_trigger_unless_reactivating() {
        let h = start().await;
        let trigger = h
            .service()
            .create_trigger(scheduled(
                "daily",
                ScheduleConfig::RecurringAtTimeOfDay { hour: 6, minute: 0 },
            ))
            .await
            .unwrap();
        let id = trigger.id;

        let paused = h
            .service()
            .update_trigger(id, TriggerPatch {
                is_active: Some(false),
                ..TriggerPatch::default()
            })
            .await
            .unwrap();
        assert!(!paused.is_active);
        assert_eq!(h.handle.scheduler().armed_at(id), None);

        let err = context_of(
            h.service()
                .update_trigger(id, TriggerPatch {
                    name: Some("renamed".to_string()),
                    ..TriggerPatch::default()
                })
                .await,
        );
        assert_eq!(err, ServiceError::Inactive { id });

        let resumed = h
            .service()
            .update_trigger(id, TriggerPatch {
                is_active: Some(true),
                ..TriggerPatch::default()
            })
            .await
            .unwrap();
        let tomorrow_six = epoch() + Duration::hours(18);
        assert_eq!(resumed.next_run_at, Some(tomorrow_six));
        assert_eq!(h.handle.scheduler().armed_at(id), Some(tomorrow_six));
    }

    #[tokio::test]
    async fn update_rejects_config_of_other_type() {
        let h = start().await;
        let trigger = h.service().create_trigger(hook("hook")).await.unwrap();

        let err = context_of(
            h.service()
                .update_trigger(trigger.id, TriggerPatch {
                    schedule_config: Some(ScheduleConfig::RecurringInterval {
                        unit: IntervalUnit::Hours,
                        value: 1,
                    }),
                    ..TriggerPatch::default()
                })
                .await,
        );
        assert!(matches!(
            err,
            ServiceError::Validation {
                error: ValidationError::KindMismatch { .. }
            }
        ));
    }

    #[tokio::test]
    async fn delete_disarms_and_hides_trigger() {
        let h = start().await;
        let trigger = h
            .service()
            .create_trigger(scheduled(
                "hourly",
                ScheduleConfig::RecurringInterval {
                    unit: IntervalUnit::Hours,
                    value: 1,
                },
            ))
            .await
            .unwrap();
        let id = trigger.id;
        assert!(h.handle.scheduler().armed_at(id).is_some());

        h.service().delete_trigger(id).await.unwrap();

        assert_eq!(h.handle.scheduler().armed_at(id), None);
        assert_eq!(
            context_of(h.service().get_trigger(id).await),
            ServiceError::NotFound { id }
        );
        assert_eq!(
            context_of(h.service().delete_trigger(id).await),
            ServiceError::NotFound { id }
        );

        h.clock.advance(Duration::hours(1));
        h.handle.scheduler().drain().await;
        assert!(events_for(h.events.as_ref(), id).await.is_empty());
    }

    #[tokio::test]
    async fn execute_now_checks_payload() {
        let h = start().await;
        let api = h.service().create_trigger(hook("hook")).await.unwrap();
        let sched = h
            .service()
            .create_trigger(scheduled(
                "hourly",
                ScheduleConfig::RecurringInterval {
                    unit: IntervalUnit::Hours,
                    value: 1,
                },
            ))
            .await
            .unwrap();

        let mut bad = Map::new();
        bad.insert("user_id".to_string(), json!("x"));
        assert!(matches!(
            context_of(h.service().execute_trigger_now(api.id, Some(bad)).await),
            ServiceError::Validation { .. }
        ));

        let mut good = Map::new();
        good.insert("user_id".to_string(), json!(9));
        let event = h
            .service()
            .execute_trigger_now(api.id, Some(good))
            .await
            .unwrap();
        assert!(event.is_manual);
        assert_eq!(event.request_payload, Some(json!({"user_id": 9})));

        assert_eq!(
            context_of(
                h.service()
                    .execute_trigger_now(sched.id, Some(Map::new()))
                    .await
            ),
            ServiceError::Validation {
                error: ValidationError::PayloadNotAccepted {
                    trigger_type: TriggerType::Scheduled
                }
            }
        );
        let manual = h
            .service()
            .execute_trigger_now(sched.id, None)
            .await
            .unwrap();
        assert_eq!(manual.trigger_type, TriggerType::Scheduled);
        assert_eq!(h.caller.calls(), 1);
    }

    #[tokio::test]
    async fn test_trigger_is_never_persisted() {
        let h = start().await;

        let outcome = h.service().test_trigger(hook("dry run"), None).await.unwrap();
        let TestOutcome::Executed { event } = outcome else {
            panic!("api definitions execute immediately");
        };
        assert!(event.is_test);
        assert_eq!(h.caller.calls(), 1);

        let outcome = h
            .service()
            .test_trigger(
                scheduled(
                    "dry run daily",
                    ScheduleConfig::RecurringAtTimeOfDay {
                        hour: 12,
                        minute: 30,
                    },
                ),
                None,
            )
            .await
            .unwrap();
        let TestOutcome::Scheduled { trigger_id, due_at } = outcome else {
            panic!("scheduled definitions are armed");
        };
        assert_eq!(due_at, epoch() + Duration::minutes(30));

        h.clock.advance(Duration::minutes(30));
        let events = Arc::clone(&h.events);
        eventually("test fire", || {
            let events = Arc::clone(&events);
            async move { events_for(events.as_ref(), trigger_id).await.len() == 1 }
        })
        .await;

        assert!(h.service().list_triggers(false).await.unwrap().is_empty());
        assert_eq!(h.handle.scheduler().armed_at(trigger_id), None);
    }

    #[tokio::test]
    async fn restart_recovers_triggers_and_sweeps_events() {
        let repo = Arc::new(InMemoryTriggerRepository::new());
        let events = Arc::new(InMemoryEventStore::new());
        let policy = RetentionPolicy::default();

        let mut persisted = scheduled(
            "hourly",
            ScheduleConfig::RecurringInterval {
                unit: IntervalUnit::Hours,
                value: 1,
            },
        )
        .into_trigger(epoch() - Duration::days(1));
        persisted.next_run_at = Some(epoch() - Duration::hours(3));
        repo.create(persisted.clone()).await.unwrap();

        let stale = NewEvent::success(persisted.id, "hourly", TriggerType::Scheduled)
            .into_event(epoch() - Duration::hours(3), &policy);
        let expired = NewEvent::success(persisted.id, "hourly", TriggerType::Scheduled)
            .into_event(epoch() - Duration::hours(49), &policy);
        events.create(stale.clone()).await.unwrap();
        events.create(expired.clone()).await.unwrap();

        let h = start_with(events, repo).await;

        assert_eq!(h.handle.scheduler().armed_count(), 1);
        let due = h.handle.scheduler().armed_at(persisted.id).unwrap();
        assert!(due > epoch() && due <= epoch() + Duration::hours(1));

        assert!(h.events.get(expired.id).is_none());
        let archived = h.events.get(stale.id).unwrap();
        assert_eq!(archived.retention_state, RetentionState::Archived);
        assert_eq!(archived.archived_at, Some(epoch()));
    }

    #[tokio::test]
    async fn executed_event_is_archived_after_two_hours() {
        let h = start().await;
        let trigger = h.service().create_trigger(hook("hook")).await.unwrap();
        let event = h
            .service()
            .execute_trigger_now(trigger.id, None)
            .await
            .unwrap();
        assert_eq!(h.service().get_recent_events(None).await.unwrap().len(), 1);

        h.clock.advance(Duration::hours(2));

        let events = Arc::clone(&h.events);
        let id = event.id;
        eventually("event archived", || {
            let events = Arc::clone(&events);
            async move {
                events
                    .get(id)
                    .is_some_and(|e| e.retention_state == RetentionState::Archived)
            }
        })
        .await;

        assert!(h.service().get_recent_events(None).await.unwrap().is_empty());
        let archived = h.service().get_archived_events(None).await.unwrap();
        assert_eq!(archived.len(), 1);
        let stats = h.service().get_event_stats(None).await.unwrap();
        assert_eq!(stats[0].manual_executions, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_every_timer() {
        let h = start().await;
        h.service()
            .create_trigger(scheduled(
                "hourly",
                ScheduleConfig::RecurringInterval {
                    unit: IntervalUnit::Hours,
                    value: 1,
                },
            ))
            .await
            .unwrap();
        assert!(h.handle.armed_timers() >= 3);

        let scheduler = h.handle.scheduler().clone();
        h.handle.shutdown().await;
        assert_eq!(scheduler.armed_count(), 0);
    }
}
