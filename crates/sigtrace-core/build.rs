//! Build script for sigtrace-core
//!
//! This script checks build requirements before compilation:
//! - Minimum Rust version (Rust 1.70.0+ for `Option::is_some_and` and const `Mutex::new`)
//! - Target support (native unwinding is only implemented for Linux and macOS on
//!   x86-64 and ARM64; other targets build a stub that reports itself unsupported)

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 70, 0);

        if rustc_version < min_rust_version {
            panic!(
                "sigtrace-core requires Rust {} or newer, found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    check_target_support();
}

/// Build scripts run on the host, so the target has to be read from Cargo's
/// environment rather than from `#[cfg]`.
fn check_target_support()
{
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    let os_supported = matches!(os.as_str(), "linux" | "macos");
    let arch_supported = matches!(arch.as_str(), "x86_64" | "aarch64");

    if !(os_supported && arch_supported) {
        println!(
            "cargo:warning=sigtrace-core: native backtraces are not available on {arch}-{os}; \
             state creation will fail and the fault handler will stay disabled"
        );
    }
}
