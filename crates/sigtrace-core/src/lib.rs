//! # sigtrace-core
//!
//! In-process native backtraces with DWARF symbolication, including from
//! inside a fatal-signal handler.
//!
//! This crate provides:
//! - Debug-info loading for one binary image ([`DebugInfoReader`])
//! - A cached, shareable per-image state ([`BacktraceState`])
//! - Allocation-free stack unwinding ([`Unwinder`]) and symbolication ([`Symbolicator`])
//! - A fault handler that reports crash locations for SIGSEGV, SIGABRT and friends
//!   ([`enable_fault_handler`])
//!
//! ## Platform Support
//!
//! - **Linux** (x86-64, ARM64): DWARF CFI unwinding from the in-memory
//!   `.eh_frame` tables, frame-pointer fallback
//! - **macOS** (x86-64, ARM64): frame-pointer unwinding, `.dSYM` bundles
//! - **Other targets**: [`supported`] returns `false` and state creation fails
//!
//! ## Why unsafe code is needed
//!
//! Capturing registers needs inline assembly, walking the stack reads raw
//! memory, and the fault handler installs signal dispositions and runs under
//! the async-signal-safety rules. These calls are wrapped in safe functions.
//!
//! ## Example
//!
//! ```no_run
//! let frames = sigtrace_core::get_backtrace(0);
//! for (i, frame) in frames.iter().enumerate() {
//!     println!("#{i} {frame}");
//! }
//!
//! sigtrace_core::enable_fault_handler(None, Some(std::path::Path::new("crash.log")));
//! ```

#![allow(unsafe_code)] // Required for register capture, stack reads and signal handling

pub mod config;
pub mod debug_info;
pub mod error;
pub mod fault;
pub mod platform;
pub mod prelude;
pub mod state;
pub mod symbolize;
pub mod types;
pub mod unwind;

use std::hint::black_box;
use std::io::{self, Write};
use std::path::Path;

pub use config::FaultHandlerConfig;
pub use debug_info::{DebugIndex, DebugInfoReader};
pub use error::{BacktraceError, Result};
pub use fault::{FaultSignal, SignalSet};
pub use state::{BacktraceState, ProcessImage};
pub use symbolize::{Resolved, Symbolicator};
use tracing::warn;
pub use types::{Address, Frame, RawFrame, MAX_FRAMES};
pub use unwind::{Registers, Unwinder};

/// Whether native backtraces are available on this platform.
pub fn supported() -> bool
{
    platform::SUPPORTED
}

/// Create a backtrace state for `filename`, or the current executable.
///
/// See [`BacktraceState::create`].
pub fn create_state(filename: Option<&Path>, threaded: bool) -> Result<BacktraceState>
{
    BacktraceState::create(filename, threaded)
}

/// Capture the caller's stack using `state`.
///
/// The frame of this function is not included.
#[inline(never)]
pub fn capture(state: &BacktraceState, skip: usize) -> Vec<Frame>
{
    black_box(state.capture(skip.saturating_add(1)))
}

/// Capture the caller's stack using the default state for the current
/// executable. Empty when native backtraces are unavailable.
#[inline(never)]
pub fn get_backtrace(skip: usize) -> Vec<Frame>
{
    let Some(state) = state::default_state() else {
        return Vec::new();
    };
    black_box(state.capture(skip.saturating_add(1)))
}

/// Print the caller's stack, one `  #<i> <frame>` line per frame.
#[inline(never)]
pub fn print_backtrace<W: Write + ?Sized>(skip: usize, out: &mut W) -> io::Result<()>
{
    let frames = get_backtrace(skip.saturating_add(1));
    if frames.is_empty() {
        writeln!(out, "  (native backtrace not available)")?;
        return Ok(());
    }
    for (i, frame) in frames.iter().enumerate() {
        writeln!(out, "  #{i} {frame}")?;
    }
    Ok(())
}

/// Names of every signal the fault handler can intercept.
pub fn list_supported_signals() -> Vec<&'static str>
{
    fault::list_supported_signals()
}

/// Names of the signals intercepted when none are given explicitly.
pub fn list_default_signals() -> Vec<&'static str>
{
    fault::list_default_signals()
}

/// Arm the fault handler for `signals` (default set when `None`), appending
/// reports to `report_path` when given.
///
/// Returns `false` when a signal name is unknown or the handler could not be
/// installed.
pub fn enable_fault_handler(signals: Option<&[&str]>, report_path: Option<&Path>) -> bool
{
    let mut config = FaultHandlerConfig::default();
    if let Some(names) = signals {
        match SignalSet::parse(names) {
            Ok(set) => config.signals = set,
            Err(err) => {
                warn!(error = %err, "refusing to enable fault handler");
                return false;
            }
        }
    }
    if let Some(path) = report_path {
        config.report_path = Some(path.to_path_buf());
    }
    fault::enable(&config)
}

/// Restore the original signal dispositions. Idempotent.
pub fn disable_fault_handler() -> bool
{
    fault::disable()
}

pub fn is_fault_handler_enabled() -> bool
{
    fault::is_enabled()
}
