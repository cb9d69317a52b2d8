//! Register state tracked while unwinding.
//!
//! Registers are indexed by their DWARF register numbers so that CFI rules can
//! be applied directly:
//!
//! | Arch   | SP | FP | Return address |
//! |--------|----|----|----------------|
//! | x86-64 | 7 (RSP) | 6 (RBP) | 16 (RA pseudo-register) |
//! | ARM64  | 31 (SP) | 29 (X29) | 30 (X30/LR) |

use std::ffi::c_void;

use crate::types::Address;

/// Number of DWARF register slots tracked. Covers x0-x30 + SP on ARM64 and the
/// general-purpose registers on x86-64.
pub(crate) const REGISTER_SLOTS: usize = 32;

#[cfg(target_arch = "x86_64")]
pub(crate) mod arch
{
    pub const SP: u16 = 7;
    pub const FP: u16 = 6;
    pub const RETURN_ADDRESS: u16 = 16;
    pub const LINK_REGISTER: Option<u16> = None;
    /// RBX, RBP, R12-R15
    pub const CALLEE_SAVED: &[u16] = &[3, 6, 12, 13, 14, 15];
    pub const ADDRESS_MASK: u64 = u64::MAX;
}

#[cfg(target_arch = "aarch64")]
pub(crate) mod arch
{
    pub const SP: u16 = 31;
    pub const FP: u16 = 29;
    pub const RETURN_ADDRESS: u16 = 30;
    pub const LINK_REGISTER: Option<u16> = Some(30);
    /// X19-X29
    pub const CALLEE_SAVED: &[u16] = &[19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29];
    /// Strips pointer-authentication bits from signed return addresses.
    pub const ADDRESS_MASK: u64 = 0x0000_ffff_ffff_ffff;
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) mod arch
{
    pub const SP: u16 = 0;
    pub const FP: u16 = 1;
    pub const RETURN_ADDRESS: u16 = 2;
    pub const LINK_REGISTER: Option<u16> = None;
    pub const CALLEE_SAVED: &[u16] = &[];
    pub const ADDRESS_MASK: u64 = u64::MAX;
}

/// Program counter plus the subset of registers whose values are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers
{
    pc: u64,
    values: [u64; REGISTER_SLOTS],
    known: u64,
}

impl Registers
{
    /// Register state with only the program counter known.
    pub const fn new(pc: u64) -> Self
    {
        Self {
            pc,
            values: [0; REGISTER_SLOTS],
            known: 0,
        }
    }

    /// Register state for a frame described by its program counter, stack
    /// pointer and frame pointer.
    pub fn with_frame(pc: u64, sp: u64, fp: u64) -> Self
    {
        let mut regs = Self::new(pc);
        regs.set(arch::SP, sp);
        regs.set(arch::FP, fp);
        regs
    }

    pub const fn pc(&self) -> Address
    {
        Address::new(self.pc)
    }

    pub(crate) fn set_pc(&mut self, pc: u64)
    {
        self.pc = pc & arch::ADDRESS_MASK;
    }

    /// Value of a DWARF register, if known.
    pub fn get(&self, register: u16) -> Option<u64>
    {
        let slot = usize::from(register);
        (slot < REGISTER_SLOTS && self.known & (1 << slot) != 0).then(|| self.values[slot])
    }

    /// Record a DWARF register value. Registers outside the tracked range are ignored.
    pub fn set(&mut self, register: u16, value: u64)
    {
        let slot = usize::from(register);
        if slot < REGISTER_SLOTS {
            self.values[slot] = value;
            self.known |= 1 << slot;
        }
    }

    pub fn sp(&self) -> Option<u64>
    {
        self.get(arch::SP)
    }

    pub fn fp(&self) -> Option<u64>
    {
        self.get(arch::FP)
    }

    /// Link register (ARM64 only).
    pub fn lr(&self) -> Option<u64>
    {
        arch::LINK_REGISTER.and_then(|register| self.get(register))
    }

    /// Snapshot of the calling function's registers.
    ///
    /// Must be inlined into the function whose frame should start the walk;
    /// the recorded pc is an exact instruction address inside that function.
    /// Returns `None` on architectures without unwinding support.
    #[inline(always)]
    pub fn current() -> Option<Self>
    {
        current_registers()
    }

    /// Registers of the interrupted context of a signal handler.
    ///
    /// # Safety
    ///
    /// `ucontext` must be null or the third argument passed by the kernel to an
    /// `SA_SIGINFO` signal handler.
    pub unsafe fn from_ucontext(ucontext: *const c_void) -> Option<Self>
    {
        if ucontext.is_null() {
            return None;
        }
        // SAFETY: non-null and provided by the kernel per the caller contract
        unsafe { ucontext_registers(ucontext.cast()) }
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn current_registers() -> Option<Registers>
{
    let (pc, sp, fp): (u64, u64, u64);
    // SAFETY: only copies registers into outputs
    unsafe {
        std::arch::asm!(
            "lea {pc}, [rip]",
            "mov {sp}, rsp",
            "mov {fp}, rbp",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            options(nomem, nostack, preserves_flags),
        );
    }
    Some(Registers::with_frame(pc, sp, fp))
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn current_registers() -> Option<Registers>
{
    let (pc, sp, fp, lr): (u64, u64, u64, u64);
    // SAFETY: only copies registers into outputs
    unsafe {
        std::arch::asm!(
            "adr {pc}, .",
            "mov {sp}, sp",
            "mov {fp}, x29",
            "mov {lr}, x30",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            lr = out(reg) lr,
            options(nomem, nostack, preserves_flags),
        );
    }
    let mut regs = Registers::with_frame(pc, sp, fp);
    regs.set(30, lr);
    Some(regs)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn current_registers() -> Option<Registers>
{
    None
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn ucontext_registers(ucontext: *const libc::ucontext_t) -> Option<Registers>
{
    // DWARF order: RAX, RDX, RCX, RBX, RSI, RDI, RBP, RSP, R8-R15
    const DWARF_TO_GREG: [libc::c_int; 16] = [
        libc::REG_RAX,
        libc::REG_RDX,
        libc::REG_RCX,
        libc::REG_RBX,
        libc::REG_RSI,
        libc::REG_RDI,
        libc::REG_RBP,
        libc::REG_RSP,
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_R14,
        libc::REG_R15,
    ];

    // SAFETY: caller guarantees a kernel-provided ucontext
    let gregs = unsafe { &(*ucontext).uc_mcontext.gregs };
    let mut regs = Registers::new(gregs[libc::REG_RIP as usize] as u64);
    for (dwarf, greg) in DWARF_TO_GREG.iter().enumerate() {
        regs.set(dwarf as u16, gregs[*greg as usize] as u64);
    }
    Some(regs)
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn ucontext_registers(ucontext: *const libc::ucontext_t) -> Option<Registers>
{
    // SAFETY: caller guarantees a kernel-provided ucontext
    let mcontext = unsafe { &(*ucontext).uc_mcontext };
    let mut regs = Registers::new(mcontext.pc);
    for (dwarf, value) in mcontext.regs.iter().enumerate() {
        regs.set(dwarf as u16, *value);
    }
    regs.set(arch::SP, mcontext.sp);
    Some(regs)
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn ucontext_registers(ucontext: *const libc::ucontext_t) -> Option<Registers>
{
    // SAFETY: caller guarantees a kernel-provided ucontext
    let mcontext = unsafe { (*ucontext).uc_mcontext };
    if mcontext.is_null() {
        return None;
    }
    // SAFETY: checked non-null above
    let state = unsafe { &(*mcontext).__ss };
    let mut regs = Registers::new(state.__rip);
    let general = [
        state.__rax,
        state.__rdx,
        state.__rcx,
        state.__rbx,
        state.__rsi,
        state.__rdi,
        state.__rbp,
        state.__rsp,
        state.__r8,
        state.__r9,
        state.__r10,
        state.__r11,
        state.__r12,
        state.__r13,
        state.__r14,
        state.__r15,
    ];
    for (dwarf, value) in general.iter().enumerate() {
        regs.set(dwarf as u16, *value);
    }
    Some(regs)
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn ucontext_registers(ucontext: *const libc::ucontext_t) -> Option<Registers>
{
    // SAFETY: caller guarantees a kernel-provided ucontext
    let mcontext = unsafe { (*ucontext).uc_mcontext };
    if mcontext.is_null() {
        return None;
    }
    // SAFETY: checked non-null above
    let state = unsafe { &(*mcontext).__ss };
    let mut regs = Registers::new(state.__pc);
    for (dwarf, value) in state.__x.iter().enumerate() {
        regs.set(dwarf as u16, *value);
    }
    regs.set(29, state.__fp);
    regs.set(30, state.__lr);
    regs.set(arch::SP, state.__sp);
    Some(regs)
}

#[cfg(not(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
unsafe fn ucontext_registers(_ucontext: *const c_void) -> Option<Registers>
{
    None
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_unknown_registers_are_none()
    {
        let regs = Registers::new(0x1000);
        assert_eq!(regs.pc(), Address::new(0x1000));
        assert_eq!(regs.sp(), None);
        assert_eq!(regs.fp(), None);
        assert_eq!(regs.get(200), None);
    }

    #[test]
    fn test_set_and_get()
    {
        let mut regs = Registers::with_frame(0x1000, 0x7fff_0000, 0x7fff_0040);
        assert_eq!(regs.sp(), Some(0x7fff_0000));
        assert_eq!(regs.fp(), Some(0x7fff_0040));

        regs.set(arch::SP, 0x7fff_0100);
        assert_eq!(regs.sp(), Some(0x7fff_0100));

        // Out-of-range registers are silently dropped
        regs.set(REGISTER_SLOTS as u16, 1);
        assert_eq!(regs.get(REGISTER_SLOTS as u16), None);
    }

    #[test]
    fn test_null_ucontext()
    {
        // SAFETY: null is explicitly allowed
        assert!(unsafe { Registers::from_ucontext(std::ptr::null()) }.is_none());
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_current_registers_are_plausible()
    {
        let regs = Registers::current().unwrap();
        let local = 0u64;
        let local_addr = std::ptr::addr_of!(local) as u64;

        assert_ne!(regs.pc(), Address::ZERO);
        let sp = regs.sp().unwrap();
        // The stack pointer is below (or at) any live local of this frame.
        assert!(sp <= local_addr);
        assert!(local_addr - sp < 1 << 20);
    }
}
