//! Error types for the scheduler crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `CallError`: outbound API call failures, recorded in failed events
//! - `ExecutorError`: an execution happened but could not be recorded
//! - `ServiceError`: what the outward service reports to its callers

use std::fmt;
use trigger_relay_core::TriggerId;
use trigger_relay_trigger::ValidationError;

/// Errors from an outbound API call.
///
/// These never propagate past the executor; they become the
/// `error_message` of a failed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// No response within the configured timeout.
    Timeout { after_secs: u64 },
    /// The endpoint could not be reached.
    ConnectionFailed { reason: String },
    /// The endpoint answered with a non-2xx status.
    Status {
        status: u16,
        body: serde_json::Value,
    },
    /// The request could not be built.
    InvalidRequest { reason: String },
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { after_secs } => {
                write!(f, "request timed out after {after_secs}s")
            }
            Self::ConnectionFailed { reason } => write!(f, "connection failed: {reason}"),
            Self::Status { status, .. } => write!(f, "endpoint returned status {status}"),
            Self::InvalidRequest { reason } => write!(f, "invalid request: {reason}"),
        }
    }
}

impl std::error::Error for CallError {}

/// Errors from the trigger executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The event for a completed execution could not be stored.
    PersistenceFailed { trigger_id: TriggerId, reason: String },
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PersistenceFailed { trigger_id, reason } => {
                write!(f, "failed to record execution of {trigger_id}: {reason}")
            }
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Errors reported by [`TriggerService`](crate::TriggerService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The request was rejected before reaching the scheduler.
    Validation { error: ValidationError },
    /// Unknown or deleted trigger.
    NotFound { id: TriggerId },
    /// The trigger is inactive and the operation needs an active one.
    Inactive { id: TriggerId },
    /// A store was unreachable or failed.
    Persistence { reason: String },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { error } => write!(f, "validation failed: {error}"),
            Self::NotFound { id } => write!(f, "trigger not found: {id}"),
            Self::Inactive { id } => write!(f, "trigger is inactive: {id}"),
            Self::Persistence { reason } => write!(f, "persistence failed: {reason}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ValidationError> for ServiceError {
    fn from(error: ValidationError) -> Self {
        Self::Validation { error }
    }
}
