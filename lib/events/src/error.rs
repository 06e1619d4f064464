//! Error types for the events crate.
//!
//! Store implementations return [`EventStoreError`]; the retention engine
//! wraps it in a rootcause report so callers can layer their own context.

use std::fmt;

/// Errors from event store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// The backing store rejected or failed the operation.
    StorageFailed { reason: String },
}

impl fmt::Display for EventStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageFailed { reason } => write!(f, "event storage failed: {reason}"),
        }
    }
}

impl std::error::Error for EventStoreError {}
