//! # sigtrace Utilities
//!
//! Shared helpers for the sigtrace workspace, mainly the `tracing` setup used
//! by the command-line front end.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{LogFormat, LogLevel, LoggingError, LoggingGuard, init_logging, init_logging_with_level};
pub use tracing::{debug, error, info, trace, warn};
