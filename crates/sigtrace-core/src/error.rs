//! # Error Types
//!
//! Error handling for backtrace state creation and fault-handler setup.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! Only setup paths return errors. Capturing a trace, resolving an address and
//! everything that runs inside a signal handler degrade silently instead: an
//! incomplete unwind or an unresolved symbol is a normal outcome, not a failure.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for sigtrace operations
///
/// ## Error Categories
///
/// 1. **Initialization errors**: Unsupported, ImageNotFound, Initialization
/// 2. **Debug info errors**: DebugInfo (never escapes [`crate::DebugInfoReader::read`])
/// 3. **Fault handler errors**: UnknownSignal, Registration
/// 4. **I/O errors**: Io
#[derive(Error, Debug)]
pub enum BacktraceError
{
    /// Native unwinding is not implemented for the current target
    ///
    /// Supported targets are Linux and macOS on x86-64 and ARM64.
    #[error("Native backtraces are not supported on this platform ({arch}-{os})")]
    Unsupported
    {
        os: &'static str,
        arch: &'static str,
    },

    /// The binary image to load debug information from does not exist
    #[error("Binary image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    /// The binary image exists but the state could not be set up
    ///
    /// Examples:
    /// - The current executable path cannot be determined
    /// - The image cannot be opened for reading
    #[error("Failed to initialize backtrace state: {0}")]
    Initialization(String),

    /// Debug information in the image is malformed
    #[error("Failed to read debug info: {0}")]
    DebugInfo(String),

    /// A signal name that is not one of the handled fatal signals
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// Installing or restoring a signal disposition failed
    #[error("Failed to register fault handler: {0}")]
    Registration(String),

    /// I/O error (for file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BacktraceError
{
    /// Error for targets without native unwinding support.
    pub fn unsupported() -> Self
    {
        BacktraceError::Unsupported {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    /// Whether this error comes from state creation.
    ///
    /// These are the errors a host wrapper reports as "native backtraces
    /// unavailable" rather than as a bug.
    pub fn is_initialization_error(&self) -> bool
    {
        matches!(
            self,
            BacktraceError::Unsupported { .. } | BacktraceError::ImageNotFound(_) | BacktraceError::Initialization(_)
        )
    }
}

#[cfg(unix)]
impl From<nix::Error> for BacktraceError
{
    fn from(err: nix::Error) -> Self
    {
        BacktraceError::Registration(err.desc().to_string())
    }
}

/// Convenience type alias for `Result<T, BacktraceError>`
///
/// ```rust
/// use sigtrace_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, BacktraceError>;
