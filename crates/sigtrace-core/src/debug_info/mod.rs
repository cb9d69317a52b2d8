//! # Debug Info
//!
//! Turns one binary image into an immutable [`DebugIndex`].
//!
//! ## Sources
//!
//! - **DWARF `.debug_info`**: function and inlined-call address ranges, with
//!   names taken from linkage names (demangled) or plain names
//! - **DWARF `.debug_line`**: address to file/line mapping, read through `addr2line`
//! - **Symbol table**: nearest-symbol fallback for code without DWARF
//!
//! On macOS the DWARF usually lives in a `.dSYM` bundle next to the executable;
//! it is picked up automatically when the executable itself carries none.
//!
//! ## References
//!
//! - [DWARF Debugging Information Format](https://dwarfstd.org/)
//! - [gimli crate documentation](https://docs.rs/gimli/latest/gimli/)

mod demangle;
mod index;
mod reader;

pub use index::DebugIndex;
#[cfg(test)]
pub(crate) use index::IndexBuilder;
pub use reader::DebugInfoReader;
