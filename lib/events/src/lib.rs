//! Execution events and their retention for trigger-relay.
//!
//! This crate provides:
//! - The [`Event`] record and per-trigger [`EventStats`]
//! - The [`EventStore`] contract and an in-memory implementation
//! - The [`RetentionEngine`], which archives and purges events by age

pub mod error;
pub mod event;
pub mod retention;
pub mod store;

pub use error::EventStoreError;
pub use event::{Event, EventStats, EventStatus, NewEvent, RetentionState};
pub use retention::{RetentionEngine, RetentionPolicy};
pub use store::{EventQuery, EventStore, InMemoryEventStore};
