//! Immutable, sorted address index built from one binary image.
//!
//! The index is a handful of flat vectors sorted by start address plus one
//! interned string table. Lookups are binary searches that borrow from the
//! index and never allocate, which is what makes them usable from inside a
//! signal handler.

use std::collections::HashMap;

/// Handle into the interned string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StrId(u32);

/// Address range covered by a function or an inlined call site.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FunctionRange
{
    pub start: u64,
    pub end: u64,
    /// Nesting depth of the DIE, `0` for a top-level subprogram
    pub depth: u32,
    pub name: StrId,
}

/// Contiguous run of instructions attributed to one source line.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LineRange
{
    pub start: u64,
    pub end: u64,
    pub file: StrId,
    pub line: u32,
}

/// Text symbol from the object's symbol table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SymbolRange
{
    pub start: u64,
    pub end: u64,
    pub name: StrId,
}

/// Debug-info index for one binary image.
///
/// All addresses stored here are file addresses; the `bias` converts runtime
/// program counters into them.
#[derive(Debug, Default)]
pub struct DebugIndex
{
    bias: u64,
    strings: Vec<Box<str>>,
    /// Sorted by `(start asc, end desc, depth asc)`
    functions: Vec<FunctionRange>,
    /// `reach[i]` is the largest `end` among `functions[..=i]`
    reach: Vec<u64>,
    /// Sorted by `start`
    lines: Vec<LineRange>,
    /// Sorted by `start`, non-overlapping
    symbols: Vec<SymbolRange>,
}

impl DebugIndex
{
    /// An index that resolves nothing.
    pub fn empty(bias: u64) -> Self
    {
        Self {
            bias,
            ..Self::default()
        }
    }

    /// Load bias of the image this index was built for.
    pub fn bias(&self) -> u64
    {
        self.bias
    }

    pub fn is_empty(&self) -> bool
    {
        self.functions.is_empty() && self.lines.is_empty() && self.symbols.is_empty()
    }

    pub fn function_count(&self) -> usize
    {
        self.functions.len()
    }

    pub fn line_count(&self) -> usize
    {
        self.lines.len()
    }

    pub fn symbol_count(&self) -> usize
    {
        self.symbols.len()
    }

    pub(crate) fn string(&self, id: StrId) -> &str
    {
        self.strings.get(id.0 as usize).map_or("", |s| s)
    }

    /// Tightest function range containing `addr`.
    ///
    /// Ranges are sorted by start with larger ranges first, so scanning
    /// backwards from the last range starting at or before `addr` visits inner
    /// ranges before the ranges that enclose them. The scan stops as soon as no
    /// earlier range can reach `addr`.
    pub(crate) fn function_at(&self, addr: u64) -> Option<&FunctionRange>
    {
        let upper = self.functions.partition_point(|range| range.start <= addr);
        for index in (0..upper).rev() {
            if self.reach[index] <= addr {
                break;
            }
            let range = &self.functions[index];
            if addr < range.end {
                return Some(range);
            }
        }
        None
    }

    /// Line entry for `addr`: the entry with the greatest start not exceeding
    /// `addr`, accepted when it covers `addr` or when it starts inside
    /// `within` (the enclosing function's range).
    pub(crate) fn line_at(&self, addr: u64, within: Option<(u64, u64)>) -> Option<&LineRange>
    {
        let upper = self.lines.partition_point(|range| range.start <= addr);
        let candidate = self.lines.get(upper.checked_sub(1)?)?;
        let covers = addr < candidate.end;
        let same_function = within.is_some_and(|(start, end)| candidate.start >= start && addr < end);
        (covers || same_function).then_some(candidate)
    }

    /// Nearest preceding text symbol covering `addr`.
    pub(crate) fn symbol_at(&self, addr: u64) -> Option<&SymbolRange>
    {
        let upper = self.symbols.partition_point(|symbol| symbol.start <= addr);
        let symbol = self.symbols.get(upper.checked_sub(1)?)?;
        (addr < symbol.end).then_some(symbol)
    }
}

/// Mutable accumulator that produces a [`DebugIndex`].
#[derive(Debug, Default)]
pub(crate) struct IndexBuilder
{
    strings: Vec<Box<str>>,
    interned: HashMap<Box<str>, StrId>,
    functions: Vec<FunctionRange>,
    lines: Vec<LineRange>,
    symbols: Vec<SymbolRange>,
}

impl IndexBuilder
{
    pub(crate) fn new() -> Self
    {
        Self::default()
    }

    pub(crate) fn intern(&mut self, value: &str) -> StrId
    {
        if let Some(id) = self.interned.get(value) {
            return *id;
        }
        let id = StrId(u32::try_from(self.strings.len()).unwrap_or(u32::MAX));
        self.strings.push(value.into());
        self.interned.insert(value.into(), id);
        id
    }

    /// Record a function or inlined-call range. Empty ranges and ranges
    /// starting at address zero (code removed by the linker) are dropped.
    pub(crate) fn add_function(&mut self, start: u64, end: u64, depth: u32, name: &str)
    {
        if start == 0 || end <= start {
            return;
        }
        let name = self.intern(name);
        self.functions.push(FunctionRange { start, end, depth, name });
    }

    pub(crate) fn add_line(&mut self, start: u64, end: u64, file: &str, line: u32)
    {
        if start == 0 || end <= start || line == 0 {
            return;
        }
        let file = self.intern(file);
        self.lines.push(LineRange { start, end, file, line });
    }

    /// Record a symbol. A `size` of zero means "until the next symbol".
    pub(crate) fn add_symbol(&mut self, start: u64, size: u64, name: &str)
    {
        if start == 0 || name.is_empty() {
            return;
        }
        let name = self.intern(name);
        self.symbols.push(SymbolRange {
            start,
            end: start.saturating_add(size),
            name,
        });
    }

    pub(crate) fn finish(self, bias: u64) -> DebugIndex
    {
        let IndexBuilder {
            strings,
            mut functions,
            mut lines,
            mut symbols,
            ..
        } = self;

        functions.sort_unstable_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(b.end.cmp(&a.end))
                .then(a.depth.cmp(&b.depth))
        });
        let mut reach = Vec::with_capacity(functions.len());
        let mut max_end = 0;
        for range in &functions {
            max_end = max_end.max(range.end);
            reach.push(max_end);
        }

        lines.sort_unstable_by_key(|range| (range.start, range.end));
        lines.dedup_by_key(|range| range.start);

        symbols.sort_unstable_by_key(|symbol| (symbol.start, std::cmp::Reverse(symbol.end)));
        symbols.dedup_by_key(|symbol| symbol.start);
        // Sized symbols keep their extent; unsized ones run to the next symbol.
        for index in 0..symbols.len() {
            let next_start = symbols.get(index + 1).map_or(u64::MAX, |next| next.start);
            let symbol = &mut symbols[index];
            if symbol.end == symbol.start || symbol.end > next_start {
                symbol.end = next_start;
            }
        }

        DebugIndex {
            bias,
            strings,
            functions,
            reach,
            lines,
            symbols,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn sample_index() -> DebugIndex
    {
        let mut builder = IndexBuilder::new();
        builder.add_function(0x1000, 0x1100, 0, "outer");
        builder.add_function(0x1020, 0x1040, 1, "inlined_helper");
        builder.add_function(0x1028, 0x1030, 2, "deeply_inlined");
        builder.add_function(0x2000, 0x2010, 0, "other");
        builder.add_line(0x1000, 0x1010, "src/lib.rs", 10);
        builder.add_line(0x1010, 0x1020, "src/lib.rs", 11);
        builder.add_line(0x1020, 0x1040, "src/helper.rs", 3);
        builder.add_symbol(0x1000, 0x100, "outer_sym");
        builder.add_symbol(0x3000, 0, "stripped_a");
        builder.add_symbol(0x3050, 0x10, "stripped_b");
        builder.finish(0)
    }

    #[test]
    fn test_innermost_range_wins()
    {
        let index = sample_index();
        let name = |addr| index.function_at(addr).map(|f| index.string(f.name).to_string());

        assert_eq!(name(0x1004).as_deref(), Some("outer"));
        assert_eq!(name(0x1024).as_deref(), Some("inlined_helper"));
        assert_eq!(name(0x102c).as_deref(), Some("deeply_inlined"));
        assert_eq!(name(0x1030).as_deref(), Some("inlined_helper"));
        assert_eq!(name(0x1050).as_deref(), Some("outer"));
        assert_eq!(name(0x1100), None);
        assert_eq!(name(0x2008).as_deref(), Some("other"));
        assert_eq!(name(0x0fff), None);
    }

    #[test]
    fn test_identical_ranges_prefer_deeper()
    {
        let mut builder = IndexBuilder::new();
        builder.add_function(0x10, 0x20, 0, "caller");
        builder.add_function(0x10, 0x20, 1, "callee");
        let index = builder.finish(0);

        let found = index.function_at(0x18).map(|f| index.string(f.name));
        assert_eq!(found, Some("callee"));
    }

    #[test]
    fn test_line_lookup_nearest_preceding_entry()
    {
        let index = sample_index();
        let line = |addr, within| index.line_at(addr, within).map(|l| (index.string(l.file), l.line));

        assert_eq!(line(0x1000, None), Some(("src/lib.rs", 10)));
        assert_eq!(line(0x101f, None), Some(("src/lib.rs", 11)));
        assert_eq!(line(0x1024, None), Some(("src/helper.rs", 3)));
        // Past the last entry: only accepted while inside the enclosing function
        assert_eq!(line(0x1050, None), None);
        assert_eq!(line(0x1050, Some((0x1000, 0x1100))), Some(("src/helper.rs", 3)));
        assert_eq!(line(0x0500, Some((0x0400, 0x0600))), None);
    }

    #[test]
    fn test_symbol_fallback_ranges()
    {
        let index = sample_index();
        let symbol = |addr| index.symbol_at(addr).map(|s| index.string(s.name));

        assert_eq!(symbol(0x10ff), Some("outer_sym"));
        assert_eq!(symbol(0x1100), None);
        // Unsized symbols extend to the next one
        assert_eq!(symbol(0x3040), Some("stripped_a"));
        assert_eq!(symbol(0x3055), Some("stripped_b"));
        assert_eq!(symbol(0x3060), None);
    }

    #[test]
    fn test_zero_and_empty_ranges_are_dropped()
    {
        let mut builder = IndexBuilder::new();
        builder.add_function(0, 0x40, 0, "dead_code");
        builder.add_function(0x40, 0x40, 0, "empty");
        builder.add_line(0, 0x10, "dead.rs", 1);
        let index = builder.finish(0);

        assert!(index.is_empty());
        assert!(index.function_at(0x20).is_none());
    }

    #[test]
    fn test_strings_are_interned()
    {
        let mut builder = IndexBuilder::new();
        let first = builder.intern("src/lib.rs");
        let second = builder.intern("src/lib.rs");
        assert_eq!(first, second);
        assert_ne!(first, builder.intern("src/main.rs"));
    }
}
