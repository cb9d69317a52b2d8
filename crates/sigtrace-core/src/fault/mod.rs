//! # Fault Handler
//!
//! Intercepts fatal signals, writes a symbolicated backtrace of the faulting
//! thread, then lets the signal take its original course.
//!
//! ## Lifecycle
//!
//! 1. [`enable`] parses the debug information of the current executable up
//!    front, since nothing may be parsed or allocated once a signal arrives.
//! 2. The configuration and the parsed image are published as an immutable
//!    snapshot behind an `AtomicPtr`. The handler only ever loads that pointer.
//! 3. On delivery the handler moves to a dedicated report stack, unwinds from
//!    the interrupted context and writes the report. It then restores the
//!    signal's original disposition and re-raises it (or calls the original
//!    handler directly). The fault is never swallowed.
//! 4. [`disable`] restores every original disposition and clears the snapshot.
//!
//! Enable and disable are serialized by a process-wide mutex. A replaced
//! snapshot is freed only while no handler is running; otherwise it is leaked,
//! since that handler may still be reading it.
//!
//! Only the first fault of the process is reported. A second fault, including
//! one raised while the report is being written, goes straight to the
//! original disposition.
//!
//! Signal handling exists on Unix targets only. Elsewhere the functions here
//! report that nothing can be armed.

#[cfg(unix)]
mod handler;
#[cfg(unix)]
mod report;
mod signals;
#[cfg(unix)]
mod stack;

#[cfg(unix)]
pub use handler::{disable, enable, is_enabled, try_enable};
pub use signals::{FaultSignal, SignalSet};

use crate::platform;

/// Every signal the fault handler can intercept. Empty on unsupported
/// platforms.
pub fn list_supported_signals() -> Vec<&'static str>
{
    if !platform::SUPPORTED {
        return Vec::new();
    }
    FaultSignal::ALL.iter().map(|signal| signal.name()).collect()
}

/// Signals intercepted when no explicit list is given. Empty on unsupported
/// platforms.
pub fn list_default_signals() -> Vec<&'static str>
{
    if !platform::SUPPORTED {
        return Vec::new();
    }
    FaultSignal::DEFAULTS.iter().map(|signal| signal.name()).collect()
}

#[cfg(not(unix))]
mod disabled
{
    use crate::config::FaultHandlerConfig;
    use crate::error::{BacktraceError, Result};

    pub fn is_enabled() -> bool
    {
        false
    }

    pub fn enable(config: &FaultHandlerConfig) -> bool
    {
        try_enable(config).is_ok()
    }

    pub fn try_enable(_config: &FaultHandlerConfig) -> Result<()>
    {
        Err(BacktraceError::unsupported())
    }

    pub fn disable() -> bool
    {
        false
    }
}

#[cfg(not(unix))]
pub use disabled::{disable, enable, is_enabled, try_enable};

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_signal_lists()
    {
        if !platform::SUPPORTED {
            assert!(list_supported_signals().is_empty());
            assert!(list_default_signals().is_empty());
            return;
        }
        assert_eq!(
            list_supported_signals(),
            vec!["SIGSEGV", "SIGABRT", "SIGFPE", "SIGBUS", "SIGILL", "SIGTRAP", "SIGSYS"]
        );
        assert_eq!(list_default_signals(), vec!["SIGSEGV", "SIGABRT", "SIGFPE", "SIGBUS"]);
    }

    #[test]
    fn test_nothing_is_armed_where_unsupported()
    {
        if platform::SUPPORTED {
            return;
        }
        assert!(!enable(&crate::config::FaultHandlerConfig::default()));
        assert!(!is_enabled());
        assert!(!disable());
    }
}
