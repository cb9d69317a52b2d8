//! In-memory `.eh_frame` tables of the loaded modules.
//!
//! The loader already maps `.eh_frame_hdr` and `.eh_frame` of every module, so
//! the tables are read straight from memory rather than from the files on disk.
//! The `.eh_frame_hdr` binary-search table locates the FDE for an address
//! without scanning.

use std::mem::size_of;

use gimli::{
    BaseAddresses, EhFrame, EhFrameHdr, EndianSlice, NativeEndian, ParsedEhFrameHdr, Pointer, Register, RegisterRule,
    UnwindContext, UnwindContextStorage, UnwindSection, UnwindTableRow,
};
use tracing::debug;

use crate::platform::LoadedObject;

type MappedSlice = EndianSlice<'static, NativeEndian>;

/// Unwind context storage that lives entirely on the stack, so evaluating CFI
/// never touches the allocator.
pub(crate) struct StackStorage;

impl<T: gimli::ReaderOffset> UnwindContextStorage<T> for StackStorage
{
    type Rules = [(Register, RegisterRule<T>); 32];
    type Stack = [UnwindTableRow<T, Self>; 4];
}

pub(crate) type StackUnwindContext = UnwindContext<usize, StackStorage>;
pub(crate) type StackUnwindRow = UnwindTableRow<usize, StackStorage>;

/// `.eh_frame` data of one loaded module.
struct UnwindModule
{
    start: u64,
    end: u64,
    bases: BaseAddresses,
    eh_frame: EhFrame<MappedSlice>,
    header: ParsedEhFrameHdr<MappedSlice>,
}

impl UnwindModule
{
    /// # Safety
    ///
    /// The object's segments must stay mapped for as long as the module is used.
    unsafe fn from_object(object: &LoadedObject) -> Option<Self>
    {
        let (hdr_address, hdr_size) = object.eh_frame_hdr?;
        let (start, end) = object.text_range()?;
        let address_size = size_of::<usize>() as u8;

        // SAFETY: PT_GNU_EH_FRAME describes mapped, read-only memory
        let hdr_bytes = unsafe { mapped_slice(hdr_address, hdr_size)? };
        let bases = BaseAddresses::default().set_eh_frame_hdr(hdr_address).set_text(start);
        let header = EhFrameHdr::new(hdr_bytes, NativeEndian).parse(&bases, address_size).ok()?;
        header.table()?;

        let Pointer::Direct(eh_frame_address) = header.eh_frame_ptr() else {
            return None;
        };
        // `.eh_frame` has no size of its own in memory; bound it by its segment.
        let segment = object
            .segments
            .iter()
            .find(|segment| segment.contains(eh_frame_address))?;
        // SAFETY: the range lies inside a mapped PT_LOAD segment
        let eh_bytes = unsafe { mapped_slice(eh_frame_address, segment.end - eh_frame_address)? };

        let mut eh_frame = EhFrame::new(eh_bytes, NativeEndian);
        eh_frame.set_address_size(address_size);

        Some(Self {
            start,
            end,
            bases: bases.set_eh_frame(eh_frame_address),
            eh_frame,
            header,
        })
    }

    fn row_for<'ctx>(&self, address: u64, ctx: &'ctx mut StackUnwindContext) -> Option<&'ctx StackUnwindRow>
    {
        let table = self.header.table()?;
        let fde = table
            .fde_for_address(&self.eh_frame, &self.bases, address, EhFrame::cie_from_offset)
            .ok()?;
        fde.unwind_info_for_address(&self.eh_frame, &self.bases, ctx, address).ok()
    }
}

/// CFI tables for every module that was loaded when the tables were built.
#[derive(Default)]
pub struct UnwindTables
{
    /// Sorted by `start`
    modules: Vec<UnwindModule>,
}

impl UnwindTables
{
    /// Tables with no modules: unwinding falls back to frame pointers.
    pub fn empty() -> Self
    {
        Self::default()
    }

    /// Build tables from a snapshot of the loaded objects.
    ///
    /// Modules unloaded afterwards must not be unwound through; the tables are
    /// meant for the lifetime of the process image they were built from.
    pub fn from_objects(objects: &[LoadedObject]) -> Self
    {
        // SAFETY: objects come from the live loader list of this process
        let mut modules: Vec<UnwindModule> = objects
            .iter()
            .filter_map(|object| unsafe { UnwindModule::from_object(object) })
            .collect();
        modules.sort_unstable_by_key(|module| module.start);
        debug!(
            modules = modules.len(),
            objects = objects.len(),
            "built unwind tables"
        );
        Self { modules }
    }

    pub fn module_count(&self) -> usize
    {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.modules.is_empty()
    }

    fn module_for(&self, address: u64) -> Option<&UnwindModule>
    {
        let upper = self.modules.partition_point(|module| module.start <= address);
        let module = self.modules.get(upper.checked_sub(1)?)?;
        (address < module.end).then_some(module)
    }

    /// CFI row describing how to unwind from `address`, if any module covers it.
    pub(crate) fn row_for<'ctx>(&self, address: u64, ctx: &'ctx mut StackUnwindContext) -> Option<&'ctx StackUnwindRow>
    {
        self.module_for(address)?.row_for(address, ctx)
    }
}

impl std::fmt::Debug for UnwindTables
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("UnwindTables")
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// # Safety
///
/// `[address, address + size)` must be mapped and readable for the rest of the
/// program's life.
unsafe fn mapped_slice(address: u64, size: u64) -> Option<&'static [u8]>
{
    if address == 0 || size == 0 {
        return None;
    }
    let len = usize::try_from(size).ok()?;
    // SAFETY: per the function contract
    Some(unsafe { std::slice::from_raw_parts(address as *const u8, len) })
}
