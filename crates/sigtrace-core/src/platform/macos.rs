//! Loaded-image enumeration via the `dyld` image list.
//!
//! Only paths and slides are reported. Apple platforms always keep frame
//! pointers, so the unwinder walks frame records instead of CFI here.
//!
//! Thread stack bounds come from the pthread structure itself, which is safe
//! to read from a signal handler. There is no checked read.

use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use super::LoadedObject;

pub(super) fn loaded_objects() -> Vec<LoadedObject>
{
    // SAFETY: `_dyld_image_count` has no preconditions
    let count = unsafe { libc::_dyld_image_count() };
    let mut objects = Vec::with_capacity(count as usize);

    for index in 0..count {
        // SAFETY: `index` is below the image count; dyld returns null for images
        // removed concurrently, which is handled below.
        let (name, slide) = unsafe { (libc::_dyld_get_image_name(index), libc::_dyld_get_image_vmaddr_slide(index)) };
        let path = if name.is_null() {
            None
        } else {
            // SAFETY: non-null dyld-owned C string
            let bytes = unsafe { CStr::from_ptr(name) }.to_bytes();
            Some(PathBuf::from(OsStr::from_bytes(bytes)))
        };

        objects.push(LoadedObject {
            path,
            bias: slide as u64,
            // dyld always lists the main executable first
            is_main: index == 0,
            segments: Vec::new(),
            eh_frame_hdr: None,
        });
    }

    objects
}

pub(super) fn thread_stack_bounds() -> Option<(u64, u64)>
{
    // SAFETY: both calls only read fields of the calling thread's pthread_t
    let (top, size) = unsafe {
        let thread = libc::pthread_self();
        (libc::pthread_get_stackaddr_np(thread) as u64, libc::pthread_get_stacksize_np(thread) as u64)
    };
    if top == 0 || size == 0 {
        return None;
    }
    Some((top.checked_sub(size)?, top))
}

pub(super) fn signal_safe_stack_bounds() -> Option<(u64, u64)>
{
    thread_stack_bounds()
}

pub(super) fn read_word(_address: u64) -> Option<u64>
{
    None
}
