//! Trigger definitions for trigger-relay.
//!
//! This crate provides:
//! - The trigger model, with its schedule or API config
//! - The schedule planner ([`next_fire`])
//! - Validation of definitions, patches and payloads
//! - The [`TriggerRepository`] contract and an in-memory implementation

pub mod api;
pub mod error;
pub mod repository;
pub mod schedule;
pub mod trigger;

pub use api::{ApiConfig, HttpMethod, PayloadFieldType};
pub use error::{TriggerError, ValidationError};
pub use repository::{InMemoryTriggerRepository, TriggerFilter, TriggerRepository};
pub use schedule::{IntervalUnit, ScheduleConfig, next_fire};
pub use trigger::{NewTrigger, Trigger, TriggerKind, TriggerPatch, TriggerType};
