//! Tests for error handling

use std::path::PathBuf;

use sigtrace_core::error::{BacktraceError, Result};
use sigtrace_core::FaultSignal;

#[test]
fn test_unsupported_display()
{
    let error = BacktraceError::unsupported();
    let message = format!("{}", error);
    assert!(message.contains("not supported"));
    assert!(message.contains(std::env::consts::OS));
    assert!(error.is_initialization_error());
}

#[test]
fn test_image_not_found_display()
{
    let error = BacktraceError::ImageNotFound(PathBuf::from("/opt/app/bin/server"));
    let message = format!("{}", error);
    assert!(message.contains("/opt/app/bin/server"));
    assert!(error.is_initialization_error());
}

#[test]
fn test_unknown_signal_is_not_an_initialization_error()
{
    let error = "SIGWINCH".parse::<FaultSignal>().unwrap_err();
    assert_eq!(format!("{}", error), "Unknown signal: SIGWINCH");
    assert!(!error.is_initialization_error());
}

#[test]
fn test_io_error_conversion()
{
    let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let error: BacktraceError = io_err.into();

    match error {
        BacktraceError::Io(_) => {
            // Expected
        }
        _ => panic!("Expected Io variant"),
    }
}

#[cfg(unix)]
#[test]
fn test_nix_error_becomes_registration_error()
{
    let error: BacktraceError = nix::Error::EINVAL.into();
    assert!(matches!(error, BacktraceError::Registration(_)));
    assert!(format!("{}", error).contains("register"));
}

#[test]
fn test_result_type_alias()
{
    fn returns_result() -> Result<u32>
    {
        Ok(42)
    }

    assert_eq!(returns_result().unwrap(), 42);
}
