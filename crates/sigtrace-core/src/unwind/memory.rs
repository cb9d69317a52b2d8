//! Stack memory access for the unwinder.

use crate::platform;

/// Minimal memory accessor required for stack unwinding.
///
/// Reads return `None` instead of an error: an unreadable slot simply ends the
/// walk, and constructing an error value could allocate inside a signal handler.
pub trait MemoryAccess
{
    /// Read a 64-bit value from the given address.
    fn read_u64(&self, address: u64) -> Option<u64>;
}

/// Largest distance above the starting stack pointer that the unwinder reads
/// when the thread's stack bounds are unknown.
pub const MAX_STACK_SPAN: u64 = 64 * 1024 * 1024;

/// Reads from the current thread's stack, above the stack pointer the walk
/// started from.
///
/// When the thread's stack range is known, every address in
/// `[start_sp, stack top)` is mapped and is read directly. Otherwise the
/// window extends [`MAX_STACK_SPAN`] above the start and each read goes
/// through [`platform::read_word`], which fails instead of faulting; where no
/// such read exists the walk ends at the first memory access.
#[derive(Debug, Clone, Copy)]
pub struct StackMemory
{
    low: u64,
    high: u64,
    bounded: bool,
}

impl StackMemory
{
    /// Reads bounded by the calling thread's stack.
    ///
    /// Looks the stack range up on first use per thread; not for signal
    /// handlers.
    pub fn for_current_thread(start_sp: u64) -> Self
    {
        Self::from_bounds(start_sp, platform::thread_stack_bounds())
    }

    /// Async-signal-safe counterpart of [`StackMemory::for_current_thread`].
    pub fn in_signal_handler(start_sp: u64) -> Self
    {
        Self::from_bounds(start_sp, platform::signal_safe_stack_bounds())
    }

    /// Unbounded window of [`MAX_STACK_SPAN`] bytes, read only through
    /// checked reads.
    pub fn window(start_sp: u64) -> Self
    {
        Self {
            low: start_sp,
            high: start_sp.saturating_add(MAX_STACK_SPAN),
            bounded: false,
        }
    }

    fn from_bounds(start_sp: u64, bounds: Option<(u64, u64)>) -> Self
    {
        match bounds {
            // A stack pointer outside the thread's stack (alternate signal
            // stack, coroutine) falls back to the checked window.
            Some((low, high)) if start_sp >= low && start_sp < high => Self {
                low: start_sp,
                high,
                bounded: true,
            },
            _ => Self::window(start_sp),
        }
    }

    /// Whether reads are limited to the thread's real stack.
    pub fn is_bounded(&self) -> bool
    {
        self.bounded
    }

    pub fn contains(&self, address: u64) -> bool
    {
        address % 8 == 0 && address >= self.low && address.checked_add(8).is_some_and(|end| end <= self.high)
    }
}

impl MemoryAccess for StackMemory
{
    fn read_u64(&self, address: u64) -> Option<u64>
    {
        if !self.contains(address) {
            return None;
        }
        if !self.bounded {
            return platform::read_word(address);
        }
        // SAFETY: the address lies between the walk's starting stack pointer
        // and the top of the current thread's stack, all of which is mapped.
        Some(unsafe { std::ptr::read_volatile(address as *const u64) })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_window_bounds()
    {
        let memory = StackMemory::window(0x7000_0000);
        assert!(!memory.is_bounded());
        assert!(memory.contains(0x7000_0000));
        assert!(memory.contains(0x7000_0008));
        assert!(!memory.contains(0x6fff_fff8));
        assert!(!memory.contains(0x7000_0004));
        assert!(!memory.contains(0x7000_0000 + MAX_STACK_SPAN));
        assert!(!StackMemory::window(u64::MAX - 4).contains(u64::MAX - 7));
    }

    #[test]
    fn test_reads_live_stack()
    {
        let values = [0x1122_3344_5566_7788u64, 0x99];
        let base = values.as_ptr() as u64;
        let memory = StackMemory::for_current_thread(base);

        if !platform::SUPPORTED {
            return;
        }
        assert!(memory.is_bounded());
        assert_eq!(memory.read_u64(base), Some(0x1122_3344_5566_7788));
        assert_eq!(memory.read_u64(base + 8), Some(0x99));
        assert_eq!(memory.read_u64(base - 8), None);
    }

    #[test]
    fn test_bounded_reads_stop_at_the_stack_top()
    {
        let Some((_, high)) = platform::thread_stack_bounds() else {
            return;
        };
        let local = 0u64;
        let memory = StackMemory::for_current_thread(std::ptr::addr_of!(local) as u64 & !7);

        assert!(!memory.contains(high));
        assert_eq!(memory.read_u64(high), None);
        assert_eq!(memory.read_u64(high + 4096), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_window_reads_skip_unmapped_pages()
    {
        // SAFETY: sysconf has no preconditions
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        // SAFETY: fresh anonymous mapping, unmapped at the end of the test
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                2 * page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        // SAFETY: both pages belong to the mapping above
        unsafe {
            base.cast::<u64>().write(0xfeed);
            assert_eq!(libc::mprotect(base.cast::<u8>().add(page).cast(), page, libc::PROT_NONE), 0);
        }

        let start = base as u64;
        let memory = StackMemory::window(start);
        assert!(memory.contains(start + page as u64));
        assert_eq!(memory.read_u64(start + page as u64), None);
        assert!(memory.read_u64(start).map_or(true, |value| value == 0xfeed));

        // SAFETY: unmaps the mapping created above
        unsafe { libc::munmap(base, 2 * page) };
    }
}
