//! Core types shared across the trigger-relay workspace.
//!
//! - **Identifiers**: ULID-backed, prefix-displayed ids
//! - **Clock**: real and fake time sources
//! - **Timers**: token-keyed one-shot and interval timers over a clock

pub mod clock;
pub mod error;
pub mod id;
pub mod timer;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::Result;
pub use id::{EventId, ParseIdError, TriggerId};
pub use timer::{TimerFire, TimerSource, TimerToken};
