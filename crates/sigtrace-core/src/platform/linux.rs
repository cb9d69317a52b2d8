//! Loaded-object enumeration via `dl_iterate_phdr`, thread stack bounds via
//! `pthread_getattr_np` and checked reads via `process_vm_readv`.

use std::cell::Cell;
use std::env;
use std::ffi::{c_int, c_void, CStr, OsStr};
use std::io::IoSliceMut;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;

use super::{LoadedObject, Segment};

thread_local! {
    static STACK_BOUNDS: Cell<Option<(u64, u64)>> = const { Cell::new(None) };
}

/// Set once `process_vm_readv` turns out to be blocked (seccomp) or missing.
static CHECKED_READS_BLOCKED: AtomicBool = AtomicBool::new(false);

pub(super) fn loaded_objects() -> Vec<LoadedObject>
{
    let mut objects: Vec<LoadedObject> = Vec::new();
    // SAFETY: the callback only touches `objects` through the data pointer,
    // and `dl_iterate_phdr` does not retain it after returning.
    unsafe {
        libc::dl_iterate_phdr(Some(collect_object), std::ptr::addr_of_mut!(objects).cast());
    }

    // The main program is reported first, usually with an empty name.
    if let Some(main) = objects.first_mut() {
        main.is_main = true;
        if main.path.is_none() {
            main.path = env::current_exe().ok();
        }
    }
    objects
}

unsafe extern "C" fn collect_object(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> c_int
{
    // SAFETY: `data` is the `Vec` passed by `loaded_objects`, `info` is valid for
    // the duration of the callback.
    let (objects, info) = unsafe { (&mut *data.cast::<Vec<LoadedObject>>(), &*info) };

    let name = if info.dlpi_name.is_null() {
        &[][..]
    } else {
        // SAFETY: non-null loader-owned C string
        unsafe { CStr::from_ptr(info.dlpi_name) }.to_bytes()
    };
    let path = (!name.is_empty()).then(|| PathBuf::from(OsStr::from_bytes(name)));

    let bias = info.dlpi_addr as u64;
    let headers = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        // SAFETY: the loader guarantees `dlpi_phnum` program headers at `dlpi_phdr`
        unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) }
    };

    let mut segments = Vec::new();
    let mut eh_frame_hdr = None;
    for header in headers {
        let start = bias.wrapping_add(header.p_vaddr);
        match header.p_type {
            libc::PT_LOAD => segments.push(Segment {
                start,
                end: start.saturating_add(header.p_memsz),
                executable: header.p_flags & libc::PF_X != 0,
            }),
            libc::PT_GNU_EH_FRAME => eh_frame_hdr = Some((start, header.p_memsz)),
            _ => {}
        }
    }

    objects.push(LoadedObject {
        path,
        bias,
        is_main: false,
        segments,
        eh_frame_hdr,
    });
    0
}

pub(super) fn thread_stack_bounds() -> Option<(u64, u64)>
{
    if let Some(bounds) = STACK_BOUNDS.with(Cell::get) {
        return Some(bounds);
    }
    let bounds = query_stack_bounds()?;
    STACK_BOUNDS.with(|cell| cell.set(Some(bounds)));
    Some(bounds)
}

/// `pthread_getattr_np` may allocate, so a signal handler gets no bounds here.
pub(super) fn signal_safe_stack_bounds() -> Option<(u64, u64)>
{
    None
}

fn query_stack_bounds() -> Option<(u64, u64)>
{
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    let mut base: *mut c_void = ptr::null_mut();
    let mut size: libc::size_t = 0;

    // SAFETY: `attr` is initialized by pthread_getattr_np before use and
    // destroyed exactly once.
    let status = unsafe {
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return None;
        }
        let status = libc::pthread_attr_getstack(attr.as_ptr(), &mut base, &mut size);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        status
    };
    if status != 0 || base.is_null() || size == 0 {
        return None;
    }
    let low = base as u64;
    Some((low, low.checked_add(size as u64)?))
}

pub(super) fn read_word(address: u64) -> Option<u64>
{
    if CHECKED_READS_BLOCKED.load(Ordering::Relaxed) {
        return None;
    }
    let mut word = [0u8; 8];
    let remote = [RemoteIoVec {
        base: usize::try_from(address).ok()?,
        len: word.len(),
    }];
    match process_vm_readv(Pid::this(), &mut [IoSliceMut::new(&mut word)], &remote) {
        Ok(read) if read == word.len() => Some(u64::from_ne_bytes(word)),
        Ok(_) => None,
        Err(Errno::ENOSYS | Errno::EPERM) => {
            CHECKED_READS_BLOCKED.store(true, Ordering::Relaxed);
            None
        }
        Err(_) => None,
    }
}
