//! Error handling foundation for trigger-relay.
//!
//! Only the `Result` alias lives here. Each crate defines its own error
//! enums in its `error` module and wraps them in rootcause reports, adding
//! layer-appropriate context via `.context()` as errors propagate.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
