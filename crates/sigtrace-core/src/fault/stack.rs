//! Stacks the fault handler runs on.
//!
//! The alternate signal stack is what the kernel switches to when it delivers
//! a signal installed with `SA_ONSTACK`, so that a stack overflow can still be
//! handled. It is per thread, and threads started by the Rust runtime already
//! carry a small one of their own.
//!
//! The report stack is a single mapping the handler moves to before unwinding
//! and symbolizing. Whatever stack the signal arrived on only has to hold the
//! kernel's signal frame and the handler's entry. One report stack serves the
//! whole process because at most one report is ever written.

use std::ffi::c_void;
use std::ptr;

use crate::error::Result;

/// Usable size of the report stack.
pub(super) const REPORT_STACK_SIZE: usize = 256 * 1024;

fn page_size() -> usize
{
    // SAFETY: sysconf has no preconditions
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Map `size` bytes with an inaccessible guard page below them.
///
/// Returns the lowest usable address. The mapping is never released.
fn map_guarded(size: usize) -> Result<*mut u8>
{
    let page_size = page_size();
    let size = (size + page_size - 1) / page_size * page_size;

    // SAFETY: anonymous private mapping, checked below
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size + page_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: the first page belongs to the mapping above
    if unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: stays inside the mapping
    Ok(unsafe { base.cast::<u8>().add(page_size) })
}

/// Map an alternate signal stack for the calling thread.
///
/// # Safety
///
/// Replaces the calling thread's alternate stack, which must not be in use.
pub(super) unsafe fn create_alt_stack() -> Result<()>
{
    let stack_size = std::cmp::max(libc::SIGSTKSZ, 16 * page_size());
    let stack = libc::stack_t {
        ss_sp: map_guarded(stack_size)?.cast(),
        ss_flags: 0,
        ss_size: stack_size,
    };
    // SAFETY: `stack` describes a valid mapping that is never unmapped
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Map the report stack and return its top, aligned for a call.
pub(super) fn map_report_stack() -> Result<*mut u8>
{
    let base = map_guarded(REPORT_STACK_SIZE)?;
    // SAFETY: one past the end of the usable range
    Ok(unsafe { base.add(REPORT_STACK_SIZE) })
}

/// Call `function(argument)` with the stack pointer moved to `top`.
///
/// # Safety
///
/// `top` must be the 16-byte aligned top of a mapped stack that nothing else
/// uses for the duration of the call, and `function` must not unwind.
#[cfg(target_arch = "x86_64")]
pub(super) unsafe fn call_on_stack(top: *mut u8, function: unsafe extern "C" fn(*mut c_void), argument: *mut c_void)
{
    // SAFETY: per the function contract; r12 is callee-saved and carries the
    // original stack pointer across the call.
    unsafe {
        std::arch::asm!(
            "mov r12, rsp",
            "mov rsp, {top}",
            "call {function}",
            "mov rsp, r12",
            top = in(reg) top,
            function = in(reg) function,
            in("rdi") argument,
            out("r12") _,
            clobber_abi("C"),
        );
    }
}

/// Call `function(argument)` with the stack pointer moved to `top`.
///
/// # Safety
///
/// `top` must be the 16-byte aligned top of a mapped stack that nothing else
/// uses for the duration of the call, and `function` must not unwind.
#[cfg(target_arch = "aarch64")]
pub(super) unsafe fn call_on_stack(top: *mut u8, function: unsafe extern "C" fn(*mut c_void), argument: *mut c_void)
{
    // SAFETY: per the function contract; x20 is callee-saved and carries the
    // original stack pointer across the call.
    unsafe {
        std::arch::asm!(
            "mov x20, sp",
            "mov sp, {top}",
            "blr {function}",
            "mov sp, x20",
            top = in(reg) top,
            function = in(reg) function,
            in("x0") argument,
            out("x20") _,
            clobber_abi("C"),
        );
    }
}

/// Stays on the current stack where no stack switch is implemented.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(super) unsafe fn call_on_stack(_top: *mut u8, function: unsafe extern "C" fn(*mut c_void), argument: *mut c_void)
{
    // SAFETY: per the function contract
    unsafe { function(argument) }
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    static SEEN: AtomicU64 = AtomicU64::new(0);

    unsafe extern "C" fn record_stack_pointer(argument: *mut c_void)
    {
        let local = 0u8;
        SEEN.store(ptr::addr_of!(local) as u64, Ordering::SeqCst);
        // SAFETY: the caller passes a live `u64`
        unsafe { *argument.cast::<u64>() += 1 };
    }

    #[test]
    fn test_call_runs_on_the_given_stack()
    {
        let top = map_report_stack().unwrap();
        let mut calls = 0u64;
        // SAFETY: a fresh stack used by nothing else
        unsafe { call_on_stack(top, record_stack_pointer, ptr::addr_of_mut!(calls).cast()) };

        assert_eq!(calls, 1);
        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            let seen = SEEN.load(Ordering::SeqCst);
            let low = top as u64 - REPORT_STACK_SIZE as u64;
            assert!(seen >= low && seen < top as u64, "{seen:#x} not on the report stack");
        }
        // Back on the original stack with locals intact
        let local = 7u32;
        assert_eq!(std::hint::black_box(local), 7);
    }
}
