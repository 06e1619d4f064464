//! Timer facility: "fire token T at instant X" on top of a [`Clock`].
//!
//! Each registration runs as its own tokio task that sleeps on the clock and
//! then delivers a [`TimerFire`] on the channel returned by
//! [`TimerSource::new`]. Registrations are keyed by [`TimerToken`]; scheduling
//! a token that is already registered replaces (and aborts) the old timer.
//!
//! A fire may already sit in the channel when its timer is cancelled or
//! replaced. Consumers call [`TimerSource::acknowledge`] before acting on a
//! fire; stale generations are rejected there.

use crate::clock::Clock;
use crate::id::{EventId, TriggerId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies what a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerToken {
    /// Next fire of a scheduled trigger.
    Trigger(TriggerId),
    /// Per-event archive deadline.
    ArchiveEvent(EventId),
    /// Periodic archive sweep.
    ArchiveSweep,
    /// Periodic purge of expired events.
    CleanupSweep,
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trigger(id) => write!(f, "trigger:{id}"),
            Self::ArchiveEvent(id) => write!(f, "archive:{id}"),
            Self::ArchiveSweep => write!(f, "archive-sweep"),
            Self::CleanupSweep => write!(f, "cleanup-sweep"),
        }
    }
}

/// A timer that reached its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFire {
    /// The token the timer was registered under.
    pub token: TimerToken,
    /// Registration generation, used to detect stale fires.
    pub generation: u64,
}

#[derive(Debug)]
struct Registration {
    generation: u64,
    repeating: bool,
    due_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct TimerState {
    next_generation: u64,
    timers: HashMap<TimerToken, Registration>,
}

/// Registry of pending timers.
///
/// Cheap to clone; clones share the same registry and output channel.
#[derive(Clone)]
pub struct TimerSource {
    clock: Arc<dyn Clock>,
    fires: mpsc::UnboundedSender<TimerFire>,
    state: Arc<Mutex<TimerState>>,
}

impl TimerSource {
    /// Creates a timer source and the receiver its fires are delivered on.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<TimerFire>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            clock,
            fires: tx,
            state: Arc::new(Mutex::new(TimerState::default())),
        };
        (source, rx)
    }

    /// The clock this source sleeps on.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a one-shot timer for `token` at `at`, replacing any existing
    /// registration for the same token. Returns the new generation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_at(&self, at: DateTime<Utc>, token: TimerToken) -> u64 {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let clock = Arc::clone(&self.clock);
        let fires = self.fires.clone();
        let handle = tokio::spawn(async move {
            clock.sleep_until(at).await;
            let _ = fires.send(TimerFire { token, generation });
        });

        let previous = state.timers.insert(
            token,
            Registration {
                generation,
                repeating: false,
                due_at: at,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        tracing::trace!(%token, %at, generation, "timer armed");
        generation
    }

    /// Registers a repeating timer firing every `period`, starting one period
    /// from now. Missed ticks are skipped rather than replayed.
    pub fn schedule_interval(&self, period: Duration, token: TimerToken) -> u64 {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let first = self.clock.now() + period;

        let clock = Arc::clone(&self.clock);
        let fires = self.fires.clone();
        let handle = tokio::spawn(async move {
            let mut deadline = first;
            loop {
                clock.sleep_until(deadline).await;
                if fires.send(TimerFire { token, generation }).is_err() {
                    break;
                }
                deadline += period;
                let now = clock.now();
                if deadline <= now {
                    deadline = now + period;
                }
            }
        });

        let previous = state.timers.insert(
            token,
            Registration {
                generation,
                repeating: true,
                due_at: first,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        tracing::debug!(%token, period_secs = period.num_seconds(), "interval timer armed");
        generation
    }

    /// Removes the timer for `token`. Returns whether one was registered.
    pub fn cancel(&self, token: TimerToken) -> bool {
        match self.lock().timers.remove(&token) {
            Some(registration) => {
                registration.handle.abort();
                tracing::trace!(%token, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every registered timer.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock().timers.drain().collect();
        for (_, registration) in drained {
            registration.handle.abort();
        }
    }

    /// Confirms a fire is still current.
    ///
    /// Returns `false` for fires whose timer was cancelled or replaced after
    /// the fire was sent. A current one-shot registration is retired here.
    pub fn acknowledge(&self, fire: &TimerFire) -> bool {
        let mut state = self.lock();
        let Some(registration) = state.timers.get(&fire.token) else {
            return false;
        };
        if registration.generation != fire.generation {
            return false;
        }
        if !registration.repeating {
            state.timers.remove(&fire.token);
        }
        true
    }

    /// Returns whether a timer is registered for `token`.
    #[must_use]
    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.lock().timers.contains_key(&token)
    }

    /// The (first) deadline of the timer registered for `token`.
    #[must_use]
    pub fn due_at(&self, token: TimerToken) -> Option<DateTime<Utc>> {
        self.lock().timers.get(&token).map(|r| r.due_at)
    }

    /// Number of registered timers.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.lock().timers.len()
    }
}

impl fmt::Debug for TimerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSource")
            .field("armed", &self.armed_count())
            .finish_non_exhaustive()
    }
}
