//! Binary image parsing and DWARF section loading.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addr2line::Context;
use gimli::{
    constants, AttributeValue, DebuggingInformationEntry, Dwarf, EndianArcSlice, Reader, RunTimeEndian, SectionId,
    Unit, UnitOffset, UnitSectionOffset,
};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::demangle::{demangle_symbol, map_dwarf_error};
use super::index::{DebugIndex, IndexBuilder};
use crate::error::{BacktraceError, Result};

type OwnedReader = EndianArcSlice<RunTimeEndian>;
type OwnedDwarf = Dwarf<OwnedReader>;

const MAX_NAME_REF_DEPTH: usize = 16;

const DWARF_SECTIONS: &[(&str, &[&str])] = &[
    (".debug_abbrev", &[".debug_abbrev", "__debug_abbrev"]),
    (".debug_addr", &[".debug_addr", "__debug_addr"]),
    (".debug_info", &[".debug_info", "__debug_info"]),
    (".debug_line", &[".debug_line", "__debug_line"]),
    (".debug_line_str", &[".debug_line_str", "__debug_line_str"]),
    (".debug_ranges", &[".debug_ranges", "__debug_ranges"]),
    (".debug_rnglists", &[".debug_rnglists", "__debug_rnglists"]),
    (".debug_str", &[".debug_str", "__debug_str"]),
    (".debug_str_offsets", &[".debug_str_offsets", "__debug_str_offsets"]),
    (".debug_types", &[".debug_types", "__debug_types"]),
];

fn load_section_bytes(file: &object::File<'_>, names: &[&str]) -> Result<Option<Arc<[u8]>>>
{
    for name in names {
        if let Some(section) = file.section_by_name(name) {
            let data = section
                .uncompressed_data()
                .map_err(|err| BacktraceError::DebugInfo(format!("failed to read {name}: {err}")))?;
            return Ok(Some(match data {
                Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes),
                Cow::Owned(vec) => vec.into(),
            }));
        }
    }

    Ok(None)
}

/// DWARF sections of one object file, shared between the gimli and addr2line views.
struct DwarfSections
{
    endian: RunTimeEndian,
    sections: HashMap<&'static str, Arc<[u8]>>,
}

impl DwarfSections
{
    fn load(file: &object::File<'_>) -> Result<Self>
    {
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let mut sections = HashMap::new();
        for (canonical, aliases) in DWARF_SECTIONS {
            if let Some(data) = load_section_bytes(file, aliases)? {
                sections.insert(*canonical, data);
            }
        }

        Ok(Self { endian, sections })
    }

    fn has_debug_info(&self) -> bool
    {
        self.sections.get(".debug_info").is_some_and(|data| !data.is_empty())
    }

    fn reader(&self, id: SectionId) -> OwnedReader
    {
        let data = self
            .sections
            .get(id.name())
            .cloned()
            .unwrap_or_else(|| Arc::<[u8]>::from(Vec::new()));
        EndianArcSlice::new(data, self.endian)
    }

    fn dwarf(&self) -> Result<OwnedDwarf>
    {
        Dwarf::load(|section| Ok::<_, gimli::Error>(self.reader(section)))
            .map_err(|err| map_dwarf_error("loading DWARF sections", err))
    }
}

/// Reads one binary image and produces its [`DebugIndex`].
///
/// Reading never fails outright. Problems are logged and whatever could be
/// indexed is kept: a binary without DWARF still yields its symbol table, a
/// corrupt binary yields an empty index.
#[derive(Debug, Clone)]
pub struct DebugInfoReader
{
    path: PathBuf,
    bias: u64,
}

impl DebugInfoReader
{
    /// Create a reader for the image at `path`.
    ///
    /// ## Parameters
    ///
    /// - `path`: Binary to read (executable or shared object)
    /// - `bias`: Difference between runtime and file addresses of the loaded image,
    ///   `0` for an image that is not loaded or not relocated
    pub fn new(path: impl Into<PathBuf>, bias: u64) -> Self
    {
        Self {
            path: path.into(),
            bias,
        }
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    pub fn bias(&self) -> u64
    {
        self.bias
    }

    /// Parse the image into an immutable index.
    pub fn read(&self) -> DebugIndex
    {
        match self.try_read() {
            Ok(index) => {
                debug!(
                    path = %self.path.display(),
                    functions = index.function_count(),
                    lines = index.line_count(),
                    symbols = index.symbol_count(),
                    "indexed debug info"
                );
                index
            }
            Err(err) => {
                warn!(path = %self.path.display(), "debug info unavailable: {err}");
                DebugIndex::empty(self.bias)
            }
        }
    }

    fn try_read(&self) -> Result<DebugIndex>
    {
        let bytes = fs::read(&self.path)?;
        let file = object::File::parse(&*bytes)
            .map_err(|err| BacktraceError::DebugInfo(format!("failed to parse {}: {err}", self.path.display())))?;
        let macho = file.format() == object::BinaryFormat::MachO;

        let mut builder = IndexBuilder::new();
        collect_symbols(&file, macho, &mut builder);

        let mut sections = DwarfSections::load(&file)?;
        if !sections.has_debug_info() {
            if let Some(companion) = load_companion_sections(&self.path) {
                sections = companion;
            }
        }

        if sections.has_debug_info() {
            // Keep the symbol table even when DWARF turns out to be unusable.
            if let Err(err) = collect_dwarf(&sections, &mut builder) {
                warn!(path = %self.path.display(), "ignoring malformed DWARF: {err}");
            }
        } else {
            debug!(path = %self.path.display(), "no DWARF debug info, using symbol table only");
        }

        Ok(builder.finish(self.bias))
    }
}

/// Path of the dSYM bundle companion of a Mach-O binary.
pub(crate) fn dsym_path(path: &Path) -> Option<PathBuf>
{
    let name = path.file_name()?;
    let mut bundle = path.as_os_str().to_owned();
    bundle.push(".dSYM");
    Some(
        PathBuf::from(bundle)
            .join("Contents")
            .join("Resources")
            .join("DWARF")
            .join(name),
    )
}

fn load_companion_sections(path: &Path) -> Option<DwarfSections>
{
    let companion = dsym_path(path)?;
    let bytes = fs::read(&companion).ok()?;
    let file = object::File::parse(&*bytes).ok()?;
    let sections = DwarfSections::load(&file).ok()?;
    debug!(path = %companion.display(), "using dSYM companion");
    sections.has_debug_info().then_some(sections)
}

fn collect_symbols(file: &object::File<'_>, macho: bool, builder: &mut IndexBuilder)
{
    for symbol in file.symbols().chain(file.dynamic_symbols()) {
        if symbol.kind() != SymbolKind::Text || !symbol.is_definition() {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        builder.add_symbol(symbol.address(), symbol.size(), &demangle_symbol(name, macho));
    }
}

fn collect_dwarf(sections: &DwarfSections, builder: &mut IndexBuilder) -> Result<()>
{
    let dwarf = sections.dwarf()?;
    let collector = FunctionCollector::new(&dwarf)?;
    collector.collect(builder);

    let context = Context::from_dwarf(sections.dwarf()?)
        .map_err(|err| map_dwarf_error("building line table context", err))?;
    let locations = context
        .find_location_range(0, u64::MAX)
        .map_err(|err| map_dwarf_error("reading line tables", err))?;
    for (start, len, location) in locations {
        let (Some(file), Some(line)) = (location.file, location.line) else {
            continue;
        };
        builder.add_line(start, start.saturating_add(len), file, line);
    }

    Ok(())
}

/// Walks every unit's DIE tree and records subprogram and inlined-call ranges.
struct FunctionCollector<'a>
{
    dwarf: &'a OwnedDwarf,
    units: Vec<Unit<OwnedReader>>,
}

impl<'a> FunctionCollector<'a>
{
    fn new(dwarf: &'a OwnedDwarf) -> Result<Self>
    {
        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers
            .next()
            .map_err(|err| map_dwarf_error("reading .debug_info unit header", err))?
        {
            units.push(
                dwarf
                    .unit(header)
                    .map_err(|err| map_dwarf_error("parsing compilation unit", err))?,
            );
        }

        Ok(Self { dwarf, units })
    }

    fn collect(&self, builder: &mut IndexBuilder)
    {
        for unit in &self.units {
            // A broken unit only costs its own functions.
            if let Err(err) = self.collect_unit(unit, builder) {
                debug!("skipping compilation unit: {err}");
            }
        }
    }

    fn collect_unit(&self, unit: &Unit<OwnedReader>, builder: &mut IndexBuilder) -> Result<()>
    {
        let mut depth: isize = 0;
        let mut cursor = unit.entries();
        while let Some((delta, entry)) = cursor.next_dfs().map_err(|err| map_dwarf_error("traversing DIE tree", err))? {
            depth += delta;
            if !matches!(entry.tag(), constants::DW_TAG_subprogram | constants::DW_TAG_inlined_subroutine) {
                continue;
            }

            // Declarations and dead-stripped instances have no code; skip them before
            // paying for name resolution.
            let mut spans: SmallVec<[(u64, u64); 4]> = SmallVec::new();
            let mut ranges = self
                .dwarf
                .die_ranges(unit, entry)
                .map_err(|err| map_dwarf_error("reading function ranges", err))?;
            while let Some(range) = ranges
                .next()
                .map_err(|err| map_dwarf_error("iterating function ranges", err))?
            {
                if range.begin != 0 && range.end > range.begin {
                    spans.push((range.begin, range.end));
                }
            }
            if spans.is_empty() {
                continue;
            }

            let Some(name) = self.function_name(unit, entry, 0)? else {
                continue;
            };
            let depth = u32::try_from(depth).unwrap_or(0);
            for (start, end) in spans {
                builder.add_function(start, end, depth, &name);
            }
        }
        Ok(())
    }

    /// Resolve a function's display name, following abstract-origin and
    /// specification references for inlined and out-of-line instances.
    fn function_name(
        &self,
        unit: &Unit<OwnedReader>,
        entry: &DebuggingInformationEntry<'_, '_, OwnedReader>,
        depth: usize,
    ) -> Result<Option<String>>
    {
        if depth >= MAX_NAME_REF_DEPTH {
            return Ok(None);
        }

        for linkage in [constants::DW_AT_linkage_name, constants::DW_AT_MIPS_linkage_name] {
            if let Some(attr) = entry
                .attr(linkage)
                .map_err(|err| map_dwarf_error("reading DW_AT_linkage_name", err))?
            {
                let raw = self.attr_to_string(unit, attr.value())?;
                return Ok(Some(demangle_symbol(&raw, false).into_owned()));
            }
        }
        if let Some(attr) = entry
            .attr(constants::DW_AT_name)
            .map_err(|err| map_dwarf_error("reading DW_AT_name", err))?
        {
            return Ok(Some(self.attr_to_string(unit, attr.value())?));
        }

        for reference in [constants::DW_AT_abstract_origin, constants::DW_AT_specification] {
            if let Some(attr) = entry
                .attr(reference)
                .map_err(|err| map_dwarf_error("reading function reference", err))?
            {
                return self.resolve_reference(unit, attr.value(), depth + 1);
            }
        }
        Ok(None)
    }

    fn resolve_reference(
        &self,
        unit: &Unit<OwnedReader>,
        value: AttributeValue<OwnedReader>,
        depth: usize,
    ) -> Result<Option<String>>
    {
        match value {
            AttributeValue::UnitRef(offset) => self.function_name_at_offset(unit, offset, depth),
            AttributeValue::DebugInfoRef(offset) => {
                let target = UnitSectionOffset::from(offset);
                match self.find_unit_for_offset(target) {
                    Some((target_unit, unit_offset)) => self.function_name_at_offset(target_unit, unit_offset, depth),
                    None => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    fn function_name_at_offset(
        &self,
        unit: &Unit<OwnedReader>,
        offset: UnitOffset<usize>,
        depth: usize,
    ) -> Result<Option<String>>
    {
        let die = unit
            .entry(offset)
            .map_err(|err| map_dwarf_error("resolving function reference", err))?;
        self.function_name(unit, &die, depth)
    }

    fn find_unit_for_offset(&self, target: UnitSectionOffset<usize>) -> Option<(&Unit<OwnedReader>, UnitOffset<usize>)>
    {
        self.units
            .iter()
            .find_map(|unit| target.to_unit_offset(unit).map(|offset| (unit, offset)))
    }

    fn attr_to_string(&self, unit: &Unit<OwnedReader>, value: AttributeValue<OwnedReader>) -> Result<String>
    {
        let reader = self
            .dwarf
            .attr_string(unit, value)
            .map_err(|err| map_dwarf_error("resolving DWARF string", err))?;
        let owned = reader
            .to_string_lossy()
            .map_err(|err| map_dwarf_error("decoding DWARF string", err))?
            .into_owned();
        Ok(owned)
    }
}

#[cfg(test)]
mod tests
{
    use std::io::Write;

    use super::*;

    #[test]
    fn test_dsym_path_layout()
    {
        let path = dsym_path(Path::new("/tmp/build/app")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/build/app.dSYM/Contents/Resources/DWARF/app"));
    }

    #[test]
    fn test_missing_file_degrades_to_empty_index()
    {
        let reader = DebugInfoReader::new("/nonexistent/sigtrace/binary", 0x1000);
        let index = reader.read();
        assert!(index.is_empty());
        assert_eq!(index.bias(), 0x1000);
    }

    #[test]
    fn test_garbage_file_degrades_to_empty_index()
    {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an object file").unwrap();

        let index = DebugInfoReader::new(file.path(), 0).read();
        assert!(index.is_empty());
    }

    #[test]
    fn test_current_executable_has_symbols()
    {
        let exe = std::env::current_exe().unwrap();
        let index = DebugInfoReader::new(exe, 0).read();
        assert!(index.symbol_count() > 0 || index.function_count() > 0);
    }
}
