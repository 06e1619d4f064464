//! Error types for the trigger crate.
//!
//! - `ValidationError`: a definition or payload was rejected before it could
//!   reach the scheduler
//! - `TriggerError`: repository failures
//!
//! Callers wrap these in rootcause reports and add their own context.

use crate::api::PayloadFieldType;
use crate::schedule::IntervalUnit;
use crate::trigger::TriggerType;
use chrono::{DateTime, Utc};
use std::fmt;
use trigger_relay_core::TriggerId;

/// A trigger definition, patch or payload failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Trigger name was empty.
    EmptyName,
    /// Interval is below the minimum for its unit.
    IntervalTooShort {
        unit: IntervalUnit,
        value: u32,
        minimum: u32,
    },
    /// Interval is above the maximum for its unit.
    IntervalTooLong {
        unit: IntervalUnit,
        value: u32,
        maximum: u32,
    },
    /// Hour or minute out of range.
    InvalidTimeOfDay { hour: u32, minute: u32 },
    /// A one-time date is not in the future.
    NotInFuture { at: DateTime<Utc> },
    /// Endpoint is not an absolute URL with a host.
    InvalidEndpoint { endpoint: String, reason: String },
    /// HTTP method is not one of GET, POST, PUT, DELETE.
    InvalidMethod { method: String },
    /// A declared payload field is absent.
    PayloadFieldMissing { field: String },
    /// A payload field has the wrong type.
    PayloadFieldType {
        field: String,
        expected: PayloadFieldType,
    },
    /// A payload was supplied for a trigger that does not take one.
    PayloadNotAccepted { trigger_type: TriggerType },
    /// A config section does not match the trigger's type.
    KindMismatch {
        trigger_type: TriggerType,
        section: &'static str,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "trigger name must not be empty"),
            Self::IntervalTooShort {
                unit,
                value,
                minimum,
            } => write!(
                f,
                "minimum interval is {minimum} {unit}, got {value} {unit}"
            ),
            Self::IntervalTooLong {
                unit,
                value,
                maximum,
            } => write!(
                f,
                "maximum interval is {maximum} {unit}, got {value} {unit}"
            ),
            Self::InvalidTimeOfDay { hour, minute } => write!(
                f,
                "invalid time of day {hour:02}:{minute:02}: hour must be 0-23 and minute 0-59"
            ),
            Self::NotInFuture { at } => write!(f, "date must be in the future, got {at}"),
            Self::InvalidEndpoint { endpoint, reason } => {
                write!(f, "invalid endpoint '{endpoint}': {reason}")
            }
            Self::InvalidMethod { method } => write!(
                f,
                "unsupported method '{method}', expected one of GET, POST, PUT, DELETE"
            ),
            Self::PayloadFieldMissing { field } => {
                write!(f, "payload is missing field '{field}'")
            }
            Self::PayloadFieldType { field, expected } => {
                write!(f, "payload field '{field}' must be of type {expected}")
            }
            Self::PayloadNotAccepted { trigger_type } => {
                write!(f, "{trigger_type} triggers do not accept a payload")
            }
            Self::KindMismatch {
                trigger_type,
                section,
            } => write!(f, "cannot set {section} on a {trigger_type} trigger"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors from trigger repository operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Trigger not found.
    NotFound { id: TriggerId },
    /// Storage operation failed.
    StorageFailed { reason: String },
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "trigger not found: {id}"),
            Self::StorageFailed { reason } => write!(f, "trigger storage failed: {reason}"),
        }
    }
}

impl std::error::Error for TriggerError {}
