//! Stack frame types.
//!
//! [`RawFrame`] is what the unwinder produces: just a program counter and
//! whether that counter is exact. [`Frame`] is the resolved, owned form
//! returned to callers of [`crate::BacktraceState::capture`].

use std::fmt;

use super::Address;

/// Placeholder rendered in place of an unknown function name.
pub const UNKNOWN_FUNCTION: &str = "??";

/// One resolved stack frame, innermost first.
///
/// `function` and `filename` are independently optional: a stripped binary
/// still yields function names from its symbol table, and a frame with line
/// information may lack a function DIE. `line` is `0` exactly when no line
/// information was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame
{
    /// Raw program counter as recorded by the unwinder
    pub pc: Address,
    pub function: Option<String>,
    pub filename: Option<String>,
    pub line: u32,
}

impl Frame
{
    /// A frame for which nothing could be resolved.
    pub fn unresolved(pc: Address) -> Self
    {
        Self {
            pc,
            function: None,
            filename: None,
            line: 0,
        }
    }
}

impl fmt::Display for Frame
{
    /// Renders `"<function> at <file>:<line>"` or `"<function> at 0x<pc>"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        render_frame(f, self.pc, self.function.as_deref(), self.filename.as_deref(), self.line)
    }
}

/// Shared rendering for [`Frame`]'s `Display` and the crash report writer.
///
/// Writing through `core::fmt` into a fixed buffer does not allocate, so the
/// signal handler uses this same function.
pub(crate) fn render_frame<W: fmt::Write + ?Sized>(
    out: &mut W,
    pc: Address,
    function: Option<&str>,
    filename: Option<&str>,
    line: u32,
) -> fmt::Result
{
    let function = function.unwrap_or(UNKNOWN_FUNCTION);
    match filename {
        Some(file) => write!(out, "{function} at {file}:{line}"),
        None => write!(out, "{function} at 0x{:x}", pc.value()),
    }
}

/// Unresolved unwinder output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame
{
    pub pc: Address,
    /// `true` when `pc` is the interrupted instruction itself (the first frame
    /// of a signal context). Every other frame holds a return address.
    pub exact: bool,
}

impl RawFrame
{
    pub const EMPTY: Self = RawFrame {
        pc: Address::ZERO,
        exact: false,
    };

    pub const fn exact(pc: Address) -> Self
    {
        Self { pc, exact: true }
    }

    pub const fn return_address(pc: Address) -> Self
    {
        Self { pc, exact: false }
    }

    /// Address to feed to the debug index and to CFI lookups.
    ///
    /// A return address points after the call instruction, possibly past the
    /// end of the calling function when the callee does not return, so it is
    /// looked up one byte earlier.
    pub const fn lookup_address(self) -> Address
    {
        if self.exact || self.pc.is_zero() {
            self.pc
        } else {
            Address::new(self.pc.value() - 1)
        }
    }
}
