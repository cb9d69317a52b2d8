//! Symbol demangling utilities.
//!
//! Names are demangled once, while the index is built, so that lookups at
//! crash time only ever hand out finished strings.
//!
//! - **Rust**: legacy (`_ZN...E`) and v0 (`_R...`) manglings via `rustc_demangle`,
//!   rendered without the trailing hash
//! - **C/C++**: left as they are (Mach-O's leading underscore is stripped)

use std::borrow::Cow;

use rustc_demangle::try_demangle;

use crate::error::BacktraceError;

/// Demangle a raw symbol or linkage name.
///
/// ## Parameters
///
/// - `raw`: The name as stored in the symbol table or `DW_AT_linkage_name`
/// - `macho`: Whether the name comes from a Mach-O symbol table, where every C
///   symbol carries an extra leading underscore
pub(crate) fn demangle_symbol(raw: &str, macho: bool) -> Cow<'_, str>
{
    if let Ok(demangled) = try_demangle(raw) {
        return Cow::Owned(format!("{demangled:#}"));
    }
    if macho {
        if let Some(stripped) = raw.strip_prefix('_') {
            return Cow::Borrowed(stripped);
        }
    }
    Cow::Borrowed(raw)
}

/// Map a gimli DWARF error to a `BacktraceError` with context.
pub(crate) fn map_dwarf_error(context: &str, err: gimli::Error) -> BacktraceError
{
    BacktraceError::DebugInfo(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_demangle_rust_legacy_drops_hash()
    {
        let demangled = demangle_symbol("_ZN4core3fmt5write17h0123456789abcdefE", false);
        assert_eq!(demangled, "core::fmt::write");
    }

    #[test]
    fn test_demangle_leaves_c_names_alone()
    {
        assert_eq!(demangle_symbol("main", false), "main");
        assert_eq!(demangle_symbol("__libc_start_main", false), "__libc_start_main");
    }

    #[test]
    fn test_demangle_strips_macho_underscore()
    {
        assert_eq!(demangle_symbol("_main", true), "main");
        assert_eq!(demangle_symbol("_main", false), "_main");
    }
}
