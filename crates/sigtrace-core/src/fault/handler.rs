//! Signal dispositions, the published snapshot and the handler itself.

use std::ffi::{c_int, c_void, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, warn};

use super::{report, stack, FaultSignal, SignalSet};
use crate::config::FaultHandlerConfig;
use crate::error::{BacktraceError, Result};
use crate::platform;
use crate::state::{default_state, ProcessImage};
use crate::types::{RawFrame, MAX_FRAMES};
use crate::unwind::Registers;

const SIGNAL_COUNT: usize = FaultSignal::ALL.len();

/// Snapshot read by the signal handler.
struct ArmedHandler
{
    image: Arc<ProcessImage>,
    report_path: Option<CString>,
    signals: SignalSet,
    /// Disposition each signal had before it was first routed here
    originals: [Option<SigAction>; SIGNAL_COUNT],
}

/// Bookkeeping owned by enable/disable.
struct Registration
{
    originals: [Option<SigAction>; SIGNAL_COUNT],
    alt_stack: bool,
}

/// Installs a disposition and returns the previous one.
type SetAction<'a> = &'a mut dyn FnMut(Signal, &SigAction) -> nix::Result<SigAction>;

static ARMED: AtomicPtr<ArmedHandler> = AtomicPtr::new(ptr::null_mut());
/// Handlers currently between loading `ARMED` and returning.
static ACTIVE_HANDLERS: AtomicUsize = AtomicUsize::new(0);
static REPORTING: AtomicBool = AtomicBool::new(false);
/// Top of the report stack, null until the first enable.
static REPORT_STACK: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
static REGISTRATION: Mutex<Registration> = Mutex::new(Registration {
    originals: [None; SIGNAL_COUNT],
    alt_stack: false,
});

fn registration() -> MutexGuard<'static, Registration>
{
    REGISTRATION.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replace the published snapshot.
///
/// The previous snapshot is freed unless a handler is running, in which case
/// that handler may still hold it and it is leaked instead.
fn publish(handler: Option<ArmedHandler>)
{
    let next = handler.map_or(ptr::null_mut(), |handler| Box::into_raw(Box::new(handler)));
    let previous = ARMED.swap(next, Ordering::SeqCst);
    if previous.is_null() {
        return;
    }
    // A handler entering after the swap can only load `next`.
    if ACTIVE_HANDLERS.load(Ordering::SeqCst) == 0 {
        // SAFETY: produced by `Box::into_raw` above and no longer reachable
        drop(unsafe { Box::from_raw(previous) });
    }
}

fn set_action(signal: Signal, action: &SigAction) -> nix::Result<SigAction>
{
    // SAFETY: installs either `handle_fault`, which only performs
    // async-signal-safe work, or a disposition previously returned by sigaction
    unsafe { sigaction(signal, action) }
}

/// Whether a configuration is currently armed.
pub fn is_enabled() -> bool
{
    !ARMED.load(Ordering::Acquire).is_null()
}

/// Arm the fault handler, replacing any previous configuration.
///
/// Returns `false` (and logs why) when the handler could not be armed.
pub fn enable(config: &FaultHandlerConfig) -> bool
{
    match try_enable(config) {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "failed to enable fault handler");
            false
        }
    }
}

/// Arm the fault handler, replacing any previous configuration.
///
/// Signals that were handled under the previous configuration but are absent
/// from `config` get their original disposition back. When a disposition
/// cannot be installed, every signal is restored and the handler is left
/// disarmed.
pub fn try_enable(config: &FaultHandlerConfig) -> Result<()>
{
    if !platform::SUPPORTED {
        return Err(BacktraceError::unsupported());
    }
    let state = default_state()
        .ok_or_else(|| BacktraceError::Initialization("no backtrace state for the current executable".to_string()))?;
    arm(config, state.warm(), &mut set_action)
}

fn arm(config: &FaultHandlerConfig, image: Arc<ProcessImage>, set_action: SetAction<'_>) -> Result<()>
{
    let report_path = config.report_path().map(report_path_cstring).transpose()?;

    let mut registration = registration();
    if config.use_alt_stack && !registration.alt_stack {
        // SAFETY: installs a freshly mapped stack for the calling thread only
        unsafe { stack::create_alt_stack()? };
        registration.alt_stack = true;
    }
    if REPORT_STACK.load(Ordering::Acquire).is_null() {
        REPORT_STACK.store(stack::map_report_stack()?, Ordering::Release);
    }

    // Signals newly routed here during installation see no original yet and
    // fall back to the default disposition.
    publish(Some(ArmedHandler {
        image: Arc::clone(&image),
        report_path: report_path.clone(),
        signals: config.signals.clone(),
        originals: registration.originals,
    }));

    if let Err(err) = install(&mut registration, config, set_action) {
        for signal in FaultSignal::ALL {
            restore(&mut registration, signal, set_action);
        }
        publish(None);
        return Err(err);
    }
    restore_dropped(&mut registration, &config.signals, set_action);

    publish(Some(ArmedHandler {
        image,
        report_path,
        signals: config.signals.clone(),
        originals: registration.originals,
    }));

    debug!(
        signals = ?config.signals.names(),
        report_path = ?config.report_path(),
        alt_stack = config.use_alt_stack,
        "fault handler enabled"
    );
    Ok(())
}

/// Restore the original dispositions and disarm. Idempotent.
///
/// Returns `true` on supported platforms.
pub fn disable() -> bool
{
    if !platform::SUPPORTED {
        return false;
    }
    disarm(&mut set_action);
    debug!("fault handler disabled");
    true
}

fn disarm(set_action: SetAction<'_>)
{
    let mut registration = registration();
    for signal in FaultSignal::ALL {
        restore(&mut registration, signal, set_action);
    }
    publish(None);
}

fn report_path_cstring(path: &Path) -> Result<CString>
{
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| BacktraceError::Initialization(format!("report path contains a NUL byte: {}", path.display())))
}

fn install(registration: &mut Registration, config: &FaultHandlerConfig, set_action: SetAction<'_>) -> Result<()>
{
    let flags = if config.use_alt_stack {
        SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK
    } else {
        SaFlags::SA_NODEFER
    };
    let action = SigAction::new(SigHandler::SigAction(handle_fault), flags, SigSet::empty());

    for signal in config.signals.iter() {
        let previous = set_action(signal.signal(), &action)?;
        let slot = &mut registration.originals[signal.slot()];
        if slot.is_none() {
            *slot = Some(previous);
        }
    }
    Ok(())
}

fn restore_dropped(registration: &mut Registration, keep: &SignalSet, set_action: SetAction<'_>)
{
    for signal in FaultSignal::ALL {
        if !keep.contains(signal) {
            restore(registration, signal, set_action);
        }
    }
}

fn restore(registration: &mut Registration, signal: FaultSignal, set_action: SetAction<'_>)
{
    if let Some(original) = registration.originals[signal.slot()].take() {
        if let Err(err) = set_action(signal.signal(), &original) {
            warn!(signal = %signal, error = %err, "failed to restore signal disposition");
        }
    }
}

extern "C" fn handle_fault(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void)
{
    ACTIVE_HANDLERS.fetch_add(1, Ordering::SeqCst);
    // SAFETY: snapshots are only freed while no handler is active
    let armed = unsafe { ARMED.load(Ordering::SeqCst).as_ref() };

    match (armed, FaultSignal::from_number(signum)) {
        (Some(armed), Some(signal)) => {
            if armed.signals.contains(signal) && !REPORTING.swap(true, Ordering::AcqRel) {
                // SAFETY: `context` is the kernel-provided ucontext of this delivery
                unsafe { report_on_report_stack(armed, signal, context) };
            }
            // SAFETY: arguments are forwarded unchanged from the kernel
            unsafe { chain(armed.originals[signal.slot()], signum, info, context) };
        }
        _ => reset_and_raise(signum),
    }
    ACTIVE_HANDLERS.fetch_sub(1, Ordering::SeqCst);
}

/// Everything the report needs, passed across the stack switch.
struct ReportRequest<'a>
{
    armed: &'a ArmedHandler,
    signal: FaultSignal,
    context: *mut c_void,
}

/// Run [`report`] on the report stack.
///
/// # Safety
///
/// `context` must be the ucontext passed to the running signal handler, and
/// only the first reporting handler may call this.
#[inline(never)]
unsafe fn report_on_report_stack(armed: &ArmedHandler, signal: FaultSignal, context: *mut c_void)
{
    let mut request = ReportRequest { armed, signal, context };
    let argument = ptr::addr_of_mut!(request).cast::<c_void>();
    let top = REPORT_STACK.load(Ordering::Acquire);
    if top.is_null() {
        // SAFETY: `argument` points at `request`
        unsafe { report_entry(argument) };
    } else {
        // SAFETY: the report stack is used by this one report only
        unsafe { stack::call_on_stack(top, report_entry, argument) };
    }
}

unsafe extern "C" fn report_entry(argument: *mut c_void)
{
    // SAFETY: `argument` is the `ReportRequest` of `report_on_report_stack`
    let request = unsafe { &*argument.cast::<ReportRequest<'_>>() };
    // SAFETY: forwarded from the handler
    unsafe { report(request.armed, request.signal, request.context) };
}

/// # Safety
///
/// `context` must be the ucontext passed to the running signal handler.
unsafe fn report(armed: &ArmedHandler, signal: FaultSignal, context: *mut c_void)
{
    let mut frames = [RawFrame::EMPTY; MAX_FRAMES];
    // SAFETY: per the function contract
    let count = match unsafe { Registers::from_ucontext(context) } {
        Some(registers) => armed.image.unwinder().unwind_in_handler(registers, 0, &mut frames),
        None => 0,
    };
    report::write_report(
        signal,
        &armed.image.symbolicator(),
        &frames[..count],
        armed.report_path.as_deref(),
    );
}

/// Hand the signal to whatever disposition it had before.
///
/// # Safety
///
/// Arguments must be those of the running signal handler.
unsafe fn chain(original: Option<SigAction>, signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void)
{
    let Some(original) = original else {
        reset_and_raise(signum);
        return;
    };
    let Ok(sig) = Signal::try_from(signum) else {
        reset_and_raise(signum);
        return;
    };

    // SAFETY: reinstalls the disposition recorded at enable time
    let _ = unsafe { sigaction(sig, &original) };
    match original.handler() {
        SigHandler::Handler(handler) => handler(signum),
        SigHandler::SigAction(handler) => handler(signum, info, context),
        // An ignored fatal signal would resume the faulting instruction forever.
        SigHandler::SigDfl | SigHandler::SigIgn => reset_and_raise(signum),
    }
}

/// Install the default disposition and deliver `signum` again.
fn reset_and_raise(signum: c_int)
{
    // SAFETY: signal and raise are async-signal-safe
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}
