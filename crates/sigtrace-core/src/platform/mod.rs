//! # Platform Support
//!
//! Enumerates the images loaded into the current process and their load biases.
//!
//! - **Linux**: `dl_iterate_phdr`, including the in-memory location of each
//!   module's `.eh_frame_hdr` (`PT_GNU_EH_FRAME`) for CFI unwinding
//! - **macOS**: `dyld` image list and slides; unwinding relies on frame pointers,
//!   which are always present on Apple platforms
//! - **Other targets**: nothing is reported and [`SUPPORTED`] is `false`
//!
//! It also reports the calling thread's stack range and offers word reads
//! that fail instead of faulting, which keeps a walk over a corrupt stack from
//! crashing the process.

use std::fs;
use std::path::{Path, PathBuf};

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod linux;
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
use linux as imp;

#[cfg(all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod macos;
#[cfg(all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")))]
use macos as imp;

#[cfg(not(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
mod unsupported;
#[cfg(not(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
use unsupported as imp;

/// Whether native unwinding is implemented for this target.
pub const SUPPORTED: bool = cfg!(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
));

/// One mapped segment, in runtime addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment
{
    pub start: u64,
    pub end: u64,
    pub executable: bool,
}

impl Segment
{
    pub fn contains(&self, address: u64) -> bool
    {
        address >= self.start && address < self.end
    }
}

/// An executable or shared library mapped into this process.
#[derive(Debug, Clone)]
pub struct LoadedObject
{
    /// File the object was loaded from, `None` for pseudo-objects such as the vDSO
    pub path: Option<PathBuf>,
    /// Runtime address minus file address
    pub bias: u64,
    pub is_main: bool,
    pub segments: Vec<Segment>,
    /// Runtime address and size of `.eh_frame_hdr`
    pub eh_frame_hdr: Option<(u64, u64)>,
}

impl LoadedObject
{
    /// Runtime range spanned by the executable segments.
    pub fn text_range(&self) -> Option<(u64, u64)>
    {
        self.segments
            .iter()
            .filter(|segment| segment.executable)
            .fold(None, |range, segment| match range {
                None => Some((segment.start, segment.end)),
                Some((start, end)) => Some((start.min(segment.start), end.max(segment.end))),
            })
    }
}

/// Snapshot of the objects currently loaded into the process. The main
/// executable comes first.
pub fn loaded_objects() -> Vec<LoadedObject>
{
    imp::loaded_objects()
}

/// Stack range `[low, high)` of the calling thread.
///
/// The first call on a thread may allocate (glibc reads `/proc/self/maps` for
/// the main thread), so this must not be called from a signal handler.
pub fn thread_stack_bounds() -> Option<(u64, u64)>
{
    imp::thread_stack_bounds()
}

/// Stack range of the calling thread when it can be found without locking or
/// allocating. Async-signal-safe.
pub fn signal_safe_stack_bounds() -> Option<(u64, u64)>
{
    imp::signal_safe_stack_bounds()
}

/// Read one word of this process's memory without faulting.
///
/// `None` when the address is not readable, or when the platform offers no
/// checked read. Async-signal-safe.
pub fn read_word(address: u64) -> Option<u64>
{
    imp::read_word(address)
}

/// Load bias of the image at `path`.
///
/// Matches `path` against the loaded objects by canonical path, so the current
/// executable given explicitly resolves to the main program's bias. An image
/// that is not loaded gets bias `0`: its addresses are taken as file addresses.
pub fn image_bias(objects: &[LoadedObject], path: &Path) -> u64
{
    let Ok(wanted) = fs::canonicalize(path) else {
        return 0;
    };
    objects
        .iter()
        .find(|object| {
            object
                .path
                .as_deref()
                .and_then(|candidate| fs::canonicalize(candidate).ok())
                .is_some_and(|candidate| candidate == wanted)
        })
        .map_or(0, |object| object.bias)
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn object(path: &Path, bias: u64, is_main: bool) -> LoadedObject
    {
        LoadedObject {
            path: Some(path.to_path_buf()),
            bias,
            is_main,
            segments: vec![
                Segment {
                    start: 0x1000,
                    end: 0x2000,
                    executable: false,
                },
                Segment {
                    start: 0x2000,
                    end: 0x5000,
                    executable: true,
                },
                Segment {
                    start: 0x6000,
                    end: 0x7000,
                    executable: true,
                },
            ],
            eh_frame_hdr: None,
        }
    }

    #[test]
    fn test_text_range_spans_executable_segments()
    {
        let object = object(Path::new("/bin/true"), 0, true);
        assert_eq!(object.text_range(), Some((0x2000, 0x7000)));
    }

    #[test]
    fn test_image_bias_matches_canonical_path()
    {
        let exe = std::env::current_exe().unwrap();
        let objects = vec![object(&exe, 0x5555_0000, true)];

        assert_eq!(image_bias(&objects, &exe), 0x5555_0000);
        assert_eq!(image_bias(&objects, Path::new("/nonexistent/library.so")), 0);
    }

    #[test]
    fn test_thread_stack_contains_a_local()
    {
        let local = 0u64;
        let address = std::ptr::addr_of!(local) as u64;
        match thread_stack_bounds() {
            Some((low, high)) => assert!(low <= address && address < high, "{low:#x}..{high:#x} vs {address:#x}"),
            None => assert!(!SUPPORTED),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_word_never_faults()
    {
        let value = 0x5eed_u64;
        let address = std::ptr::addr_of!(value) as u64;
        // Only a sandbox that blocks process_vm_readv makes the read unavailable
        assert!(read_word(address).map_or(true, |word| word == 0x5eed));
        assert_eq!(read_word(0), None);
        assert_eq!(read_word(u64::MAX - 7), None);
    }

    #[test]
    fn test_main_executable_listed_first()
    {
        let objects = loaded_objects();
        if SUPPORTED {
            assert!(!objects.is_empty());
            assert!(objects[0].is_main);
            assert!(objects[0].path.is_some());
        } else {
            assert!(objects.is_empty());
        }
    }
}
