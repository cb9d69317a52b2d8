//! # Symbolication
//!
//! Maps program counters to function/file/line using a [`DebugIndex`].
//!
//! Resolution order for one address:
//!
//! 1. The tightest DWARF function range containing the address. When code was
//!    inlined, that is the inlined callee, not the function it was inlined into.
//! 2. The line-table entry with the greatest start not exceeding the address.
//! 3. The nearest preceding symbol-table entry, when DWARF has no function.
//!
//! Everything here borrows from the index and allocates nothing, so the fault
//! handler can call it from inside a signal handler.

use crate::debug_info::DebugIndex;
use crate::types::{Frame, RawFrame};

/// Borrowed symbolication result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolved<'a>
{
    pub function: Option<&'a str>,
    pub filename: Option<&'a str>,
    /// `0` when no line information was found
    pub line: u32,
}

impl Resolved<'_>
{
    pub fn is_unknown(&self) -> bool
    {
        self.function.is_none() && self.filename.is_none()
    }
}

/// Read-only view over a [`DebugIndex`] that resolves raw frames.
#[derive(Debug, Clone, Copy)]
pub struct Symbolicator<'a>
{
    index: &'a DebugIndex,
}

impl<'a> Symbolicator<'a>
{
    pub fn new(index: &'a DebugIndex) -> Self
    {
        Self { index }
    }

    /// Resolve one raw frame. Return addresses are looked up one byte
    /// earlier so that the call site, not the next statement, is reported.
    pub fn resolve(&self, frame: RawFrame) -> Resolved<'a>
    {
        let index = self.index;
        let Some(addr) = frame.lookup_address().to_file_address(index.bias()) else {
            return Resolved::default();
        };

        let function = index.function_at(addr);
        let within = function.map(|range| (range.start, range.end));
        let line = index.line_at(addr, within);

        let name = function
            .map(|range| index.string(range.name))
            .or_else(|| index.symbol_at(addr).map(|symbol| index.string(symbol.name)));

        Resolved {
            function: name,
            filename: line.map(|entry| index.string(entry.file)),
            line: line.map_or(0, |entry| entry.line),
        }
    }

    /// Resolve into an owned [`Frame`] carrying the raw program counter.
    pub fn frame(&self, frame: RawFrame) -> Frame
    {
        let resolved = self.resolve(frame);
        Frame {
            pc: frame.pc,
            function: resolved.function.map(str::to_owned),
            filename: resolved.filename.map(str::to_owned),
            line: resolved.line,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::debug_info::IndexBuilder;
    use crate::types::Address;

    const BIAS: u64 = 0x5555_0000_0000;

    fn index() -> DebugIndex
    {
        let mut builder = IndexBuilder::new();
        builder.add_function(0x1000, 0x1100, 0, "app::run");
        builder.add_function(0x1040, 0x1060, 1, "app::parse_header");
        builder.add_line(0x1000, 0x1040, "src/app.rs", 12);
        builder.add_line(0x1040, 0x1060, "src/header.rs", 88);
        builder.add_line(0x1060, 0x1100, "src/app.rs", 14);
        builder.add_symbol(0x1000, 0x100, "app::run");
        builder.add_symbol(0x2000, 0x80, "memcpy");
        builder.finish(BIAS)
    }

    #[test]
    fn test_resolve_exact_address()
    {
        let index = index();
        let symbolicator = Symbolicator::new(&index);
        let resolved = symbolicator.resolve(RawFrame::exact(Address::new(BIAS + 0x1010)));

        assert_eq!(resolved.function, Some("app::run"));
        assert_eq!(resolved.filename, Some("src/app.rs"));
        assert_eq!(resolved.line, 12);
    }

    #[test]
    fn test_resolve_inlined_call_reports_callee()
    {
        let index = index();
        let resolved = Symbolicator::new(&index).resolve(RawFrame::exact(Address::new(BIAS + 0x1050)));

        assert_eq!(resolved.function, Some("app::parse_header"));
        assert_eq!(resolved.filename, Some("src/header.rs"));
        assert_eq!(resolved.line, 88);
    }

    #[test]
    fn test_return_address_resolves_call_site()
    {
        let index = index();
        let symbolicator = Symbolicator::new(&index);

        // A call that is the last instruction of the inlined range returns to 0x1060.
        let frame = RawFrame::return_address(Address::new(BIAS + 0x1060));
        let resolved = symbolicator.resolve(frame);
        assert_eq!(resolved.function, Some("app::parse_header"));
        assert_eq!(resolved.line, 88);

        let owned = symbolicator.frame(frame);
        assert_eq!(owned.pc, Address::new(BIAS + 0x1060));
    }

    #[test]
    fn test_symbol_fallback_without_lines()
    {
        let index = index();
        let resolved = Symbolicator::new(&index).resolve(RawFrame::exact(Address::new(BIAS + 0x2010)));

        assert_eq!(resolved.function, Some("memcpy"));
        assert_eq!(resolved.filename, None);
        assert_eq!(resolved.line, 0);
    }

    #[test]
    fn test_unknown_addresses()
    {
        let index = index();
        let symbolicator = Symbolicator::new(&index);

        assert!(symbolicator.resolve(RawFrame::exact(Address::new(BIAS + 0x9000))).is_unknown());
        // Below the bias cannot belong to the image at all
        assert!(symbolicator.resolve(RawFrame::exact(Address::new(0x10))).is_unknown());

        let frame = symbolicator.frame(RawFrame::exact(Address::new(0x10)));
        assert_eq!(frame.to_string(), "?? at 0x10");
    }

    #[test]
    fn test_empty_index_resolves_nothing()
    {
        let index = DebugIndex::empty(0);
        let resolved = Symbolicator::new(&index).resolve(RawFrame::exact(Address::new(0x1234)));
        assert!(resolved.is_unknown());
        assert_eq!(resolved.line, 0);
    }
}
