//! End-to-end tests that run the `sigtrace` binary

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

fn sigtrace(args: &[&str]) -> Output
{
    Command::new(env!("CARGO_BIN_EXE_sigtrace"))
        .args(args)
        .env_remove("SIGTRACE_SIGNALS")
        .env_remove("SIGTRACE_REPORT_PATH")
        .env_remove("SIGTRACE_ALT_STACK")
        .output()
        .expect("failed to run sigtrace")
}

fn supported() -> bool
{
    cfg!(all(
        any(target_os = "linux", target_os = "macos"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))
}

#[test]
fn test_crash_reports_and_terminates_with_signal()
{
    if !supported() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("crash.log");

    let output = sigtrace(&["crash", "--signal", "SIGABRT", "--report", report.to_str().unwrap()]);

    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Fatal signal SIGABRT"), "stderr: {stderr}");
    assert!(stderr.contains("#0 "), "stderr: {stderr}");
    assert!(stderr.contains("crash report saved to"), "stderr: {stderr}");

    let contents = fs::read_to_string(&report).unwrap();
    assert!(contents.starts_with("#0 "), "report: {contents}");
    assert!(contents.ends_with("\n\n"), "report: {contents}");
    assert!(contents.contains("raise_fatal"), "report: {contents}");
    assert!(!contents.contains("Fatal signal"));
}

#[test]
fn test_crash_without_report_file()
{
    if !supported() {
        return;
    }
    let output = sigtrace(&["crash", "--signal", "SIGABRT", "--no-alt-stack"]);

    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("#0 "), "stderr: {stderr}");
    assert!(!stderr.contains("crash report saved to"));
}

#[test]
fn test_unhandled_signal_still_terminates()
{
    if !supported() {
        return;
    }
    let output = sigtrace(&["crash", "--signal", "SIGABRT", "--handle", "SIGSEGV"]);

    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    assert!(!String::from_utf8_lossy(&output.stderr).contains("Fatal signal"));
}

#[test]
fn test_memory_fault_is_reported_then_chained()
{
    if !supported() {
        return;
    }
    let output = sigtrace(&["crash", "--memory-fault"]);

    assert_eq!(output.status.signal(), Some(libc::SIGSEGV));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Fatal signal SIGSEGV"), "stderr: {stderr}");
    assert!(stderr.contains("touch_inaccessible_page"), "stderr: {stderr}");
    assert_eq!(stderr.matches("Fatal signal").count(), 1, "stderr: {stderr}");
}

#[test]
fn test_abort_on_spawned_thread_is_reported()
{
    if !supported() {
        return;
    }
    // The spawned thread only has the runtime's small alternate stack
    let output = sigtrace(&["crash", "--signal", "SIGABRT", "--thread"]);

    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Fatal signal SIGABRT"), "stderr: {stderr}");
    assert!(stderr.contains("#0 "), "stderr: {stderr}");
    assert!(stderr.contains("raise_fatal"), "stderr: {stderr}");
}

#[test]
fn test_memory_fault_on_spawned_thread_is_reported()
{
    if !supported() {
        return;
    }
    let output = sigtrace(&["crash", "--memory-fault", "--thread"]);

    assert_eq!(output.status.signal(), Some(libc::SIGSEGV));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Fatal signal SIGSEGV"), "stderr: {stderr}");
    assert!(stderr.contains("touch_inaccessible_page"), "stderr: {stderr}");
}

#[test]
fn test_memory_fault_conflicts_with_signal()
{
    let output = sigtrace(&["crash", "--memory-fault", "--signal", "SIGABRT"]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_signals_command()
{
    let output = sigtrace(&["signals", "--defaults"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "SIGSEGV\nSIGABRT\nSIGFPE\nSIGBUS\n");

    let output = sigtrace(&["signals"]);
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 7);
}

#[test]
fn test_trace_command()
{
    if !supported() {
        return;
    }
    let output = sigtrace(&["trace"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("Backtrace:\n  #0 "), "stdout: {stdout}");
    assert!(stdout.contains("run_command"), "stdout: {stdout}");
}

#[test]
fn test_resolve_rejects_bad_address()
{
    let output = sigtrace(&["resolve", "0xzz"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid address"));
}

#[test]
fn test_resolve_missing_binary_fails()
{
    if !supported() {
        return;
    }
    let output = sigtrace(&["resolve", "--binary", "/nonexistent/binary", "0x1000"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}
