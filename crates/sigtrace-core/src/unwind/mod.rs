//! # Stack Unwinding
//!
//! DWARF CFI (Call Frame Information) based stack unwinding with fallback heuristics.
//!
//! Each step tries, in order:
//!
//! 1. **CFI-based unwinding**: the in-memory `.eh_frame` of the module that
//!    contains the program counter gives the CFA (Canonical Frame Address) and
//!    the rules for recovering the return address and callee-saved registers.
//! 2. **Frame pointer fallback**: follows the frame record chain
//!    (`[fp]` = caller's fp, `[fp + 8]` = return address) on x86-64 and ARM64.
//! 3. **Link register fallback**: on ARM64, a leaf function interrupted by a
//!    signal may not have saved LR yet; LR then holds the return address.
//!
//! The walk is allocation-free and lock-free: frames go into a caller-provided
//! fixed array and CFI is evaluated with a stack-backed `gimli::UnwindContext`.
//! Stack reads never fault: they are limited to the thread's own stack above
//! the starting stack pointer, or made through a checked read when the stack
//! range is unknown (see [`StackMemory`]). [`Unwinder::unwind_in_handler`] is
//! safe to run inside a signal handler.
//!
//! ## References
//!
//! - [DWARF CFI Specification](https://dwarfstd.org/doc/DWARF5.pdf#page=179)
//! - [gimli crate documentation](https://docs.rs/gimli/latest/gimli/)

mod memory;
mod registers;
mod tables;

use gimli::{CfaRule, Register, RegisterRule};
pub use memory::{MemoryAccess, StackMemory, MAX_STACK_SPAN};
pub use registers::Registers;
use registers::arch;
use tables::{StackUnwindContext, StackUnwindRow};
pub use tables::UnwindTables;

use crate::types::{Address, RawFrame, MAX_FRAMES};

/// Walks the stack of the current thread.
#[derive(Debug, Clone, Copy)]
pub struct Unwinder<'a>
{
    tables: &'a UnwindTables,
}

impl<'a> Unwinder<'a>
{
    pub fn new(tables: &'a UnwindTables) -> Self
    {
        Self { tables }
    }

    /// Unwind from the caller of this function.
    ///
    /// The frame of `trace_current` itself is never recorded; `skip` drops that
    /// many further frames before recording starts.
    ///
    /// ## Returns
    ///
    /// Number of frames written to `frames`.
    #[inline(never)]
    pub fn trace_current(&self, skip: usize, frames: &mut [RawFrame; MAX_FRAMES]) -> usize
    {
        let Some(registers) = Registers::current() else {
            return 0;
        };
        self.unwind(registers, skip.saturating_add(1), frames)
    }

    /// Unwind the calling thread's stack starting from an explicit register
    /// state.
    ///
    /// The starting program counter is treated as exact (an interrupted
    /// instruction); every later frame is a return address.
    ///
    /// ## Parameters
    ///
    /// - `start`: Registers of the innermost frame, which must lie on the calling thread's stack
    /// - `skip`: Number of innermost frames to walk past without recording
    /// - `frames`: Output buffer; at most [`MAX_FRAMES`] frames are recorded
    ///
    /// ## Returns
    ///
    /// Number of frames written to `frames`.
    pub fn unwind(&self, start: Registers, skip: usize, frames: &mut [RawFrame; MAX_FRAMES]) -> usize
    {
        let Some(start_sp) = start.sp() else {
            return 0;
        };
        self.unwind_with(start, skip, &StackMemory::for_current_thread(start_sp), frames)
    }

    /// Same as [`Unwinder::unwind`], for use inside a signal handler.
    ///
    /// `start` is usually the interrupted context of the signal.
    pub fn unwind_in_handler(&self, start: Registers, skip: usize, frames: &mut [RawFrame; MAX_FRAMES]) -> usize
    {
        let Some(start_sp) = start.sp() else {
            return 0;
        };
        self.unwind_with(start, skip, &StackMemory::in_signal_handler(start_sp), frames)
    }

    /// Unwind with an explicit memory accessor.
    pub fn unwind_with<M: MemoryAccess>(
        &self,
        start: Registers,
        skip: usize,
        memory: &M,
        frames: &mut [RawFrame; MAX_FRAMES],
    ) -> usize
    {
        let mut registers = start;
        let mut exact = true;
        let mut skipped = 0;
        let mut count = 0;
        let max_steps = skip.saturating_add(MAX_FRAMES);

        for _ in 0..max_steps {
            if registers.pc().is_zero() {
                break;
            }

            let frame = RawFrame {
                pc: registers.pc(),
                exact,
            };
            if skipped < skip {
                skipped += 1;
            } else {
                frames[count] = frame;
                count += 1;
                if count == MAX_FRAMES {
                    break;
                }
            }

            let Some(next) = self.step(&registers, exact, memory) else {
                break;
            };
            registers = next;
            exact = false;
        }

        count
    }

    /// Recover the caller's registers from the current frame.
    pub fn step<M: MemoryAccess>(&self, registers: &Registers, exact: bool, memory: &M) -> Option<Registers>
    {
        self.step_with_cfi(registers, exact, memory)
            .or_else(|| step_with_frame_pointer(registers, memory))
            .or_else(|| if exact { step_with_link_register(registers) } else { None })
    }

    fn step_with_cfi<M: MemoryAccess>(&self, registers: &Registers, exact: bool, memory: &M) -> Option<Registers>
    {
        let lookup = RawFrame {
            pc: registers.pc(),
            exact,
        }
        .lookup_address();
        let mut ctx = StackUnwindContext::new_in();
        let row = self.tables.row_for(lookup.value(), &mut ctx)?;
        step_from_row(row, registers, exact, memory)
    }
}

/// Translate a resolved DWARF unwind row into the registers of the caller.
fn step_from_row<M: MemoryAccess>(
    row: &StackUnwindRow,
    registers: &Registers,
    exact: bool,
    memory: &M,
) -> Option<Registers>
{
    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => registers.get(register.0)?.checked_add_signed(*offset)?,
        CfaRule::Expression(_) => return None,
    };
    if cfa <= registers.sp()? {
        return None;
    }

    let return_address = match row.register(Register(arch::RETURN_ADDRESS)) {
        // An undefined return address marks the outermost frame, except in an
        // ARM64 leaf interrupted before it saved LR.
        RegisterRule::Undefined => {
            if exact {
                registers.lr()?
            } else {
                return None;
            }
        }
        RegisterRule::SameValue => registers.get(arch::RETURN_ADDRESS)?,
        rule => evaluate_rule(&rule, registers, cfa, memory)?,
    };

    let mut next = Registers::new(0);
    next.set_pc(return_address);
    next.set(arch::SP, cfa);
    for &register in arch::CALLEE_SAVED {
        let value = match row.register(Register(register)) {
            RegisterRule::Undefined | RegisterRule::SameValue => registers.get(register),
            rule => evaluate_rule(&rule, registers, cfa, memory),
        };
        if let Some(value) = value {
            next.set(register, value);
        }
    }
    Some(next)
}

/// Evaluate a DWARF register rule using the current registers and computed CFA.
///
/// Expression rules are not supported and yield `None`.
fn evaluate_rule<M: MemoryAccess>(rule: &RegisterRule<usize>, registers: &Registers, cfa: u64, memory: &M) -> Option<u64>
{
    match rule {
        RegisterRule::Offset(offset) => memory.read_u64(cfa.checked_add_signed(*offset)?),
        RegisterRule::ValOffset(offset) => cfa.checked_add_signed(*offset),
        RegisterRule::Register(register) => registers.get(register.0),
        _ => None,
    }
}

/// Walk the frame-pointer chain (RBP/X29) when structured unwind info is missing.
fn step_with_frame_pointer<M: MemoryAccess>(registers: &Registers, memory: &M) -> Option<Registers>
{
    let fp = registers.fp()?;
    let sp = registers.sp()?;
    if fp == 0 || fp < sp {
        return None;
    }

    let saved_fp = memory.read_u64(fp)?;
    let return_address = memory.read_u64(fp.checked_add(8)?)?;

    let mut next = Registers::new(0);
    next.set_pc(return_address);
    next.set(arch::FP, saved_fp);
    next.set(arch::SP, fp.checked_add(16)?);
    Some(next)
}

/// ARM64-only heuristic that treats the link register as the return address.
fn step_with_link_register(registers: &Registers) -> Option<Registers>
{
    let lr = registers.lr()?;
    if lr == 0 || Address::new(lr) == registers.pc() {
        return None;
    }

    let mut next = *registers;
    next.set_pc(lr);
    Some(next)
}
