//! Trigger scheduling and execution for trigger-relay.
//!
//! This crate provides:
//!
//! - **Executor**: runs a trigger once and records the event
//! - **Job scheduler**: one timer per armed trigger, non-overlapping fires
//! - **Service**: the trigger and event operations exposed over HTTP
//! - **Engine**: wiring plus the dispatch loop that routes timer fires

pub mod engine;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineHandle, SchedulerSettings};
pub use error::{CallError, ExecutorError, ServiceError};
pub use executor::{
    ApiCaller, ApiRequest, ApiResponse, ExecutionContext, ReqwestApiCaller, TriggerExecutor,
};
pub use scheduler::JobScheduler;
pub use service::{TestOutcome, TriggerService};
