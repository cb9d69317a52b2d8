use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
#[cfg(unix)]
use std::{ptr, thread};

use clap::{Parser, Subcommand};
use sigtrace_core::fault;
use sigtrace_core::{Address, BacktraceError, FaultHandlerConfig, FaultSignal, Result as BacktraceResult, SignalSet};
use sigtrace_utils::logging::format_from_env;
use sigtrace_utils::{LogLevel, info, init_logging_with_level};

/// Native backtraces and crash reports for the running process.
#[derive(Parser, Debug)]
#[command(name = "sigtrace")]
#[command(version)]
#[command(about = "Native backtraces and crash reports for the running process", long_about = None)]
struct Cli
{
    /// Default log level (RUST_LOG overrides it)
    #[arg(long, global = true, default_value = "warn")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Print the backtrace of this command
    Trace
    {
        /// Number of innermost frames to leave out
        #[arg(long, default_value_t = 0)]
        skip: usize,
    },
    /// List the signals the fault handler can intercept
    Signals
    {
        /// Only list the signals handled by default
        #[arg(long, default_value_t = false)]
        defaults: bool,
    },
    /// Arm the fault handler, then crash with a fatal signal
    Crash
    {
        /// Signal to raise
        #[arg(long, default_value = "SIGSEGV", conflicts_with = "memory_fault")]
        signal: FaultSignal,
        /// Read an inaccessible page instead of raising a signal (SIGSEGV)
        #[arg(long, default_value_t = false)]
        memory_fault: bool,
        /// Crash on a newly spawned thread instead of the main thread
        #[arg(long, default_value_t = false)]
        thread: bool,
        /// Signals to handle (comma-separated; defaults plus the raised signal)
        #[arg(long, value_delimiter = ',')]
        handle: Vec<FaultSignal>,
        /// Append the crash report to this file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Run the handler on the faulting thread's own stack
        #[arg(long, default_value_t = false)]
        no_alt_stack: bool,
    },
    /// Resolve addresses to function, file and line
    Resolve
    {
        /// Binary to read debug info from (default: this executable)
        #[arg(long)]
        binary: Option<PathBuf>,
        /// Addresses to resolve (hex with 0x prefix, or decimal)
        #[arg(required = true, value_parser = parse_address)]
        addresses: Vec<Address>,
    },
}

fn main()
{
    let cli = Cli::parse();

    // Keep the guard alive until exit so file logging is flushed
    let _logging = match format_from_env().and_then(|format| init_logging_with_level(cli.log_level, format)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(command: Commands) -> BacktraceResult<()>
{
    match command {
        Commands::Trace { skip } => {
            if !sigtrace_core::supported() {
                return Err(BacktraceError::unsupported());
            }
            let stdout = io::stdout();
            let mut out = stdout.lock();
            writeln!(out, "Backtrace:")?;
            sigtrace_core::print_backtrace(skip, &mut out)?;
            Ok(())
        }
        Commands::Signals { defaults } => {
            let names = if defaults {
                sigtrace_core::list_default_signals()
            } else {
                sigtrace_core::list_supported_signals()
            };
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Crash {
            signal,
            memory_fault,
            thread,
            handle,
            report,
            no_alt_stack,
        } => {
            let fault = if memory_fault { Fault::Memory } else { Fault::Raise(signal) };
            let mut config = FaultHandlerConfig::from_env()?;
            config = if handle.is_empty() {
                config.with_signal(fault.signal())
            } else {
                config.with_signals(handle.into_iter().collect::<SignalSet>())
            };
            if let Some(path) = report {
                config = config.with_report_path(path);
            }
            if no_alt_stack {
                config = config.with_alt_stack(false);
            }
            crash(fault, &config, thread)
        }
        Commands::Resolve { binary, addresses } => {
            let state = sigtrace_core::create_state(binary.as_deref(), false)?;
            info!("Resolving {} addresses in {}", addresses.len(), state.path().display());
            for address in addresses {
                println!("{address}: {}", state.resolve(address));
            }
            Ok(())
        }
    }
}

/// How the `crash` command brings the process down.
#[derive(Debug, Clone, Copy)]
enum Fault
{
    /// Raise the signal directly
    Raise(FaultSignal),
    /// Read an inaccessible page
    Memory,
}

impl Fault
{
    fn signal(self) -> FaultSignal
    {
        match self {
            Fault::Raise(signal) => signal,
            Fault::Memory => FaultSignal::Segv,
        }
    }
}

#[cfg(unix)]
fn crash(fault: Fault, config: &FaultHandlerConfig, on_thread: bool) -> BacktraceResult<()>
{
    // A raised signal returns to its caller if a chained handler resumes, so
    // whatever the runtime installed for it must go. A memory fault re-executes
    // and keeps the runtime's handler in the chain.
    if let Fault::Raise(signal) = fault {
        signal.reset_to_default()?;
    }
    fault::try_enable(config)?;

    info!("Crashing with {:?} on the {} thread", fault, if on_thread { "spawned" } else { "main" });
    if on_thread {
        let worker = thread::Builder::new()
            .name("crash".to_string())
            .spawn(move || trigger(fault))?;
        worker
            .join()
            .map_err(|_| BacktraceError::Registration("crash thread panicked".to_string()))??;
    } else {
        trigger(fault)?;
    }

    Err(BacktraceError::Registration(format!("{} did not terminate the process", fault.signal())))
}

#[cfg(not(unix))]
fn crash(_fault: Fault, _config: &FaultHandlerConfig, _on_thread: bool) -> BacktraceResult<()>
{
    Err(BacktraceError::unsupported())
}

#[cfg(unix)]
#[inline(never)]
fn trigger(fault: Fault) -> BacktraceResult<()>
{
    match fault {
        Fault::Raise(signal) => raise_fatal(signal),
        Fault::Memory => touch_inaccessible_page(),
    }
}

#[cfg(unix)]
#[inline(never)]
fn raise_fatal(signal: FaultSignal) -> BacktraceResult<()>
{
    match signal {
        FaultSignal::Abrt => process::abort(),
        other => other.raise(),
    }
}

#[cfg(unix)]
#[inline(never)]
fn touch_inaccessible_page() -> BacktraceResult<()>
{
    // SAFETY: maps one page without access rights; reading it raises SIGSEGV
    unsafe {
        let page = libc::mmap(
            ptr::null_mut(),
            4096,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if page == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let _value = ptr::read_volatile(page.cast::<u64>());
    }
    Ok(())
}

fn parse_address(value: &str) -> Result<Address, String>
{
    let trimmed = value.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed
        .map(Address::new)
        .map_err(|e| format!("invalid address '{value}': {e}"))
}
