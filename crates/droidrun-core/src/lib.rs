//! # droidrun-core - Core Domain Types
//!
//! Foundation crate for droidrun. Provides the logcat line parser, error
//! handling, and logging setup shared by every other crate.
//!
//! This crate has **zero internal dependencies** -- it only depends on
//! external crates (thiserror, regex, tracing).
//!
//! ## Public API
//!
//! ### Log Entries (`log_entry`)
//! - [`LogEntry`] - One parsed logcat line (severity, source tag, pid, message)
//! - [`Severity`] - Log severity (Verbose through Fatal)
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use droidrun_core::prelude::*;
//! ```

pub mod error;
pub mod log_entry;
pub mod logging;

/// Prelude for common imports used throughout all droidrun crates
pub mod prelude {
    pub use super::error::{Error, Result};
    pub use tracing::{debug, error, info, trace, warn};
}

pub use error::{Error, Result};
pub use log_entry::{LogEntry, Severity};
