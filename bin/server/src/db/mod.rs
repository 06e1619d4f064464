//! Postgres persistence for triggers and events.
//!
//! This module provides:
//! - [`PgTriggerRepository`] for trigger definitions
//! - [`PgEventStore`] for execution events

pub mod events;
pub mod triggers;

pub use events::PgEventStore;
pub use triggers::PgTriggerRepository;

fn decode_error(message: impl Into<String>) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message.into(),
    )))
}
