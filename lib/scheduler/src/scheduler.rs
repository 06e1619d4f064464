//! The job scheduler.
//!
//! Keeps the registry of armed triggers, one timer per trigger, and runs each
//! fire as its own task. Per trigger the lifecycle is
//! `Unscheduled → Armed → (Fired → Armed | Retired)`.
//!
//! The registry is never the source of truth; [`JobScheduler::recover`]
//! rebuilds it from the trigger repository.

use crate::error::ExecutorError;
use crate::executor::{ExecutionContext, TriggerExecutor};
use chrono::{DateTime, Duration, Utc};
use rootcause::Report;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use trigger_relay_core::{Clock, TimerSource, TimerToken, TriggerId};
use trigger_relay_events::{Event, RetentionEngine};
use trigger_relay_trigger::{
    ScheduleConfig, Trigger, TriggerError, TriggerFilter, TriggerPatch, TriggerRepository,
    next_fire,
};

/// A trigger with a live timer.
#[derive(Debug, Clone)]
struct ArmedJob {
    trigger: Trigger,
    due_at: DateTime<Utc>,
    /// Definition under test; not backed by the repository.
    ephemeral: bool,
}

impl ArmedJob {
    fn is_one_time(&self) -> bool {
        self.trigger
            .schedule()
            .is_none_or(ScheduleConfig::is_one_time)
    }
}

struct Inner {
    triggers: Arc<dyn TriggerRepository>,
    executor: TriggerExecutor,
    retention: RetentionEngine,
    timers: TimerSource,
    grace: Duration,
    registry: Mutex<HashMap<TriggerId, ArmedJob>>,
    lanes: Mutex<HashMap<TriggerId, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: Mutex<JoinSet<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn clock(&self) -> &Arc<dyn Clock> {
        self.timers.clock()
    }

    /// The FIFO lane serializing executions of one trigger.
    fn lane(&self, id: TriggerId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.lanes).entry(id).or_default())
    }

    fn release_lane(&self, id: TriggerId) {
        let mut lanes = lock(&self.lanes);
        if lanes.get(&id).is_some_and(|lane| Arc::strong_count(lane) == 1) {
            lanes.remove(&id);
        }
    }

    /// Registry entry and timer change together under the registry lock, so a
    /// fire being re-armed never interleaves with a disarm.
    fn disarm(&self, id: TriggerId) -> bool {
        let mut registry = lock(&self.registry);
        let removed = registry.remove(&id).is_some();
        let cancelled = self.timers.cancel(TimerToken::Trigger(id));
        removed || cancelled
    }

    /// Disarms `id` only if it is still armed for `due_at`, leaving a newer
    /// arming alone.
    fn disarm_if_due(&self, id: TriggerId, due_at: DateTime<Utc>) -> bool {
        let mut registry = lock(&self.registry);
        if registry.get(&id).is_none_or(|job| job.due_at != due_at) {
            return false;
        }
        registry.remove(&id);
        self.timers.cancel(TimerToken::Trigger(id));
        true
    }

    fn arm(&self, trigger: Trigger, due_at: DateTime<Utc>, ephemeral: bool) {
        let id = trigger.id;
        let mut registry = lock(&self.registry);
        registry.insert(
            id,
            ArmedJob {
                trigger,
                due_at,
                ephemeral,
            },
        );
        self.timers.schedule_at(due_at, TimerToken::Trigger(id));
        debug!(trigger_id = %id, %due_at, ephemeral, "trigger armed");
    }

    /// Runs one timer-driven execution inside the trigger's lane.
    async fn run_fire(&self, job: ArmedJob, next_run: Option<DateTime<Utc>>) {
        let id = job.trigger.id;
        let lane = self.lane(id);
        {
            let _guard = lane.lock().await;
            self.fire_locked(job, next_run).await;
        }
        drop(lane);
        self.release_lane(id);
    }

    async fn fire_locked(&self, job: ArmedJob, next_run: Option<DateTime<Utc>>) {
        let id = job.trigger.id;
        let one_time = job.is_one_time();

        let trigger = if job.ephemeral {
            job.trigger
        } else {
            match self.triggers.get(id).await {
                Ok(Some(current)) if current.is_live() => current,
                Ok(_) => {
                    debug!(trigger_id = %id, "discarding fire for inactive or deleted trigger");
                    if let Some(due_at) = next_run {
                        self.disarm_if_due(id, due_at);
                    }
                    return;
                }
                Err(e) => {
                    warn!(trigger_id = %id, error = %e, "could not re-check trigger, fire skipped");
                    return;
                }
            }
        };

        let context = if job.ephemeral {
            ExecutionContext::test(None)
        } else {
            ExecutionContext::scheduled()
        };
        match self.executor.execute(&trigger, context).await {
            Ok(event) => self.retention.track(&event),
            Err(report) => {
                warn!(trigger_id = %id, error = %report, "scheduled execution not recorded");
            }
        }

        if job.ephemeral {
            return;
        }
        let now = self.clock().now();
        let patch = if one_time {
            TriggerPatch {
                last_triggered_at: Some(now),
                ..TriggerPatch::deactivate()
            }
        } else {
            TriggerPatch {
                last_triggered_at: Some(now),
                next_run_at: Some(next_run),
                ..TriggerPatch::default()
            }
        };
        if let Err(e) = self.triggers.update(id, &patch, now).await {
            warn!(trigger_id = %id, error = %e, "failed to record fire on trigger");
        }
    }
}

/// Owned registry of armed triggers.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Creates a scheduler. `grace` bounds how late a one-time fire may still
    /// run after its due time has passed.
    #[must_use]
    pub fn new(
        triggers: Arc<dyn TriggerRepository>,
        executor: TriggerExecutor,
        retention: RetentionEngine,
        timers: TimerSource,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                triggers,
                executor,
                retention,
                timers,
                grace,
                registry: Mutex::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Arms `trigger`, replacing any timer it already has.
    ///
    /// Inactive, deleted and API triggers are disarmed instead. The planned
    /// fire is persisted as `next_run_at`; a persisted due time that is still
    /// in the future is kept, so a `OneTimeAfterInterval` is computed once.
    ///
    /// Returns the due time, or `None` when nothing was armed.
    ///
    /// # Errors
    ///
    /// Returns an error when the planned fire cannot be persisted.
    #[instrument(skip(self, trigger), fields(trigger_id = %trigger.id))]
    pub async fn schedule(
        &self,
        trigger: &Trigger,
    ) -> Result<Option<DateTime<Utc>>, Report<TriggerError>> {
        let id = trigger.id;
        let Some(config) = trigger.schedule() else {
            self.inner.disarm(id);
            return Ok(None);
        };
        if !trigger.is_live() {
            self.inner.disarm(id);
            return Ok(None);
        }

        let now = self.inner.clock().now();
        let Some(due_at) = self.plan(config, trigger.next_run_at, now) else {
            warn!(
                trigger_id = %id,
                "no upcoming fire within grace or calendar, retiring"
            );
            self.inner.disarm(id);
            self.inner
                .triggers
                .update(id, &TriggerPatch::deactivate(), now)
                .await?;
            return Ok(None);
        };

        if trigger.next_run_at != Some(due_at) {
            self.inner
                .triggers
                .update(id, &TriggerPatch::next_run(Some(due_at)), now)
                .await?;
        }

        let mut armed = trigger.clone();
        armed.next_run_at = Some(due_at);
        self.inner.arm(armed, due_at, false);
        Ok(Some(due_at))
    }

    fn plan(
        &self,
        config: &ScheduleConfig,
        persisted: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if let Some(at) = persisted.filter(|at| *at > now) {
            return Some(at);
        }

        let missed = match (config, persisted) {
            (ScheduleConfig::OneTimeAt { at }, _) if *at <= now => Some(*at),
            (ScheduleConfig::OneTimeAfterInterval { .. }, Some(at)) => Some(at),
            _ => None,
        };
        match missed {
            Some(at) if now - at <= self.inner.grace => Some(now),
            Some(_) => None,
            None => next_fire(config, now),
        }
    }

    /// Arms a definition under test as a single fire that never touches the
    /// repository. Its event is marked as a test.
    pub fn schedule_ephemeral(&self, trigger: Trigger) -> Option<DateTime<Utc>> {
        let now = self.inner.clock().now();
        let due_at = next_fire(trigger.schedule()?, now).unwrap_or(now);
        self.inner.arm(trigger, due_at, true);
        Some(due_at)
    }

    /// Removes the trigger's timer. Executions already running are not
    /// affected. Returns whether anything was armed.
    pub fn cancel(&self, id: TriggerId) -> bool {
        let cancelled = self.inner.disarm(id);
        if cancelled {
            debug!(trigger_id = %id, "trigger disarmed");
        }
        cancelled
    }

    /// Rebuilds the registry from the repository. Returns how many triggers
    /// were armed.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository cannot be listed. Failures to arm
    /// individual triggers are logged and skipped.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, Report<TriggerError>> {
        let triggers = self.inner.triggers.list(&TriggerFilter::armable()).await?;
        let mut armed = 0;
        for trigger in &triggers {
            match self.schedule(trigger).await {
                Ok(Some(_)) => armed += 1,
                Ok(None) => {}
                Err(report) => {
                    warn!(trigger_id = %trigger.id, error = %report, "failed to re-arm trigger");
                }
            }
        }
        info!(armed, found = triggers.len(), "scheduled triggers recovered");
        Ok(armed)
    }

    /// Handles a fire of the trigger's timer.
    ///
    /// Recurring triggers are re-armed before the execution is dispatched, so
    /// a slow or failing execution never delays the next fire. One-time
    /// triggers are retired. The execution itself runs on its own task.
    pub fn on_timer(&self, id: TriggerId) {
        let (job, next_run) = {
            let mut registry = lock(&self.inner.registry);
            let Some(job) = registry.get(&id).cloned() else {
                debug!(trigger_id = %id, "fire for unregistered trigger ignored");
                return;
            };

            let next_run = if job.is_one_time() {
                registry.remove(&id);
                None
            } else {
                let now = self.inner.clock().now();
                job.trigger
                    .schedule()
                    .and_then(|config| next_fire(config, now))
            };
            match next_run {
                Some(next) => {
                    let mut trigger = job.trigger.clone();
                    trigger.next_run_at = Some(next);
                    registry.insert(
                        id,
                        ArmedJob {
                            trigger,
                            due_at: next,
                            ephemeral: job.ephemeral,
                        },
                    );
                    self.inner.timers.schedule_at(next, TimerToken::Trigger(id));
                    debug!(trigger_id = %id, due_at = %next, "trigger re-armed");
                }
                None => {
                    registry.remove(&id);
                }
            }
            (job, next_run)
        };

        let inner = Arc::clone(&self.inner);
        let mut in_flight = lock(&self.inner.in_flight);
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move { inner.run_fire(job, next_run).await });
    }

    /// Executes `trigger` immediately, bypassing (and not disturbing) its
    /// timer. Waits behind any execution of the same trigger in progress.
    ///
    /// # Errors
    ///
    /// Returns an error when the event cannot be stored.
    #[instrument(skip(self, trigger, context), fields(trigger_id = %trigger.id))]
    pub async fn fire_now(
        &self,
        trigger: &Trigger,
        context: ExecutionContext,
    ) -> Result<Event, Report<ExecutorError>> {
        let id = trigger.id;
        let lane = self.inner.lane(id);
        let result = {
            let _guard = lane.lock().await;
            self.fire_locked(trigger, context).await
        };
        drop(lane);
        self.inner.release_lane(id);
        result
    }

    async fn fire_locked(
        &self,
        trigger: &Trigger,
        context: ExecutionContext,
    ) -> Result<Event, Report<ExecutorError>> {
        let record_fire = !context.is_test;
        let event = self.inner.executor.execute(trigger, context).await?;
        self.inner.retention.track(&event);

        if record_fire {
            let now = self.inner.clock().now();
            if let Err(e) = self
                .inner
                .triggers
                .update(trigger.id, &TriggerPatch::fired_at(now), now)
                .await
            {
                warn!(trigger_id = %trigger.id, error = %e, "failed to record fire on trigger");
            }
        }
        Ok(event)
    }

    /// Due time of the trigger's armed timer.
    #[must_use]
    pub fn armed_at(&self, id: TriggerId) -> Option<DateTime<Utc>> {
        lock(&self.inner.registry).get(&id).map(|job| job.due_at)
    }

    /// Number of armed triggers.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    /// Disarms everything and waits for in-flight executions to finish.
    pub async fn drain(&self) {
        let ids: Vec<TriggerId> = lock(&self.inner.registry).keys().copied().collect();
        for id in ids {
            self.inner.disarm(id);
        }

        let mut in_flight = std::mem::take(&mut *lock(&self.inner.in_flight));
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "execution task failed");
            }
        }
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("armed", &self.armed_count())
            .finish_non_exhaustive()
    }
}
