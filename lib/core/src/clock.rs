//! Wall-clock abstraction.
//!
//! Every temporal decision in the engine goes through a [`Clock`], so tests
//! can drive schedules and retention deadlines with a [`FakeClock`] instead of
//! waiting on real time.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Source of the current time and of deadline-based sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Completes once the clock has reached `deadline`.
    ///
    /// Returns immediately when the deadline has already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// The real system clock, backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        // Negative remaining durations fail `to_std`; those deadlines are due.
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}

#[derive(Debug)]
struct Sleeper {
    deadline: DateTime<Utc>,
    waker: oneshot::Sender<()>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

#[derive(Debug)]
struct FakeClockState {
    now: DateTime<Utc>,
    sleepers: BinaryHeap<Reverse<Sleeper>>,
}

/// A manually driven clock for tests and simulations.
///
/// Time only moves when [`FakeClock::set`] or [`FakeClock::advance`] is
/// called; sleepers whose deadline has been reached are woken at that point.
#[derive(Debug, Clone)]
pub struct FakeClock {
    state: Arc<Mutex<FakeClockState>>,
}

impl FakeClock {
    /// Creates a fake clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeClockState {
                now,
                sleepers: BinaryHeap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the clock to `t`, waking every sleeper whose deadline is due.
    ///
    /// Moving backwards is ignored; the clock is monotonic.
    pub fn set(&self, t: DateTime<Utc>) {
        let mut due = Vec::new();
        {
            let mut state = self.lock();
            if t <= state.now {
                return;
            }
            state.now = t;

            while state
                .sleepers
                .peek()
                .is_some_and(|Reverse(sleeper)| sleeper.deadline <= t)
            {
                if let Some(Reverse(sleeper)) = state.sleepers.pop() {
                    due.push(sleeper);
                }
            }
        }

        for sleeper in due {
            // The sleeping task may have been aborted in the meantime.
            let _ = sleeper.waker.send(());
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let target = self.lock().now + delta;
        self.set(target);
    }

    /// Number of sleepers still waiting for their deadline.
    #[must_use]
    pub fn pending_sleepers(&self) -> usize {
        self.lock().sleepers.len()
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let rx = {
            let mut state = self.lock();
            if deadline <= state.now {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.sleepers.push(Reverse(Sleeper {
                deadline,
                waker: tx,
            }));
            rx
        };

        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn past_deadline_returns_immediately() {
        let clock = FakeClock::new(epoch());
        clock.sleep_until(epoch() - Duration::minutes(1)).await;
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn advance_wakes_due_sleepers_only() {
        let clock = FakeClock::new(epoch());

        let early = tokio::spawn({
            let clock = clock.clone();
            async move { clock.sleep_until(epoch() + Duration::minutes(5)).await }
        });
        let late = tokio::spawn({
            let clock = clock.clone();
            async move { clock.sleep_until(epoch() + Duration::hours(1)).await }
        });

        while clock.pending_sleepers() < 2 {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::minutes(5));
        early.await.expect("early sleeper completes");
        assert!(!late.is_finished());
        assert_eq!(clock.pending_sleepers(), 1);

        clock.advance(Duration::hours(1));
        late.await.expect("late sleeper completes");
    }

    #[test]
    fn set_never_moves_backwards() {
        let clock = FakeClock::new(epoch());
        clock.set(epoch() - Duration::hours(1));
        assert_eq!(clock.now(), epoch());
    }

    #[tokio::test]
    async fn system_clock_past_deadline_does_not_block() {
        let clock = SystemClock;
        clock.sleep_until(Utc::now() - Duration::seconds(5)).await;
    }
}
