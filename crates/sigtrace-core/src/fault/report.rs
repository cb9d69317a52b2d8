//! Crash report output from inside a signal handler.
//!
//! Only async-signal-safe calls are made here: text is formatted into a fixed
//! stack buffer through `core::fmt` and written with raw `write(2)`. Write
//! failures are ignored; there is nobody left to report them to.

use std::ffi::{c_int, CStr};
use std::fmt::{self, Write as _};

use nix::errno::Errno;

use super::FaultSignal;
use crate::symbolize::Symbolicator;
use crate::types::frame::render_frame;
use crate::types::RawFrame;

/// Longest line emitted; longer lines are truncated.
const LINE_CAPACITY: usize = 1024;

const STDERR: c_int = libc::STDERR_FILENO;

/// Fixed-capacity line buffer. Text beyond the capacity is dropped.
pub(crate) struct LineBuffer
{
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer
{
    pub(crate) const fn new() -> Self
    {
        Self {
            bytes: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    pub(crate) fn clear(&mut self)
    {
        self.len = 0;
    }

    pub(crate) fn as_bytes(&self) -> &[u8]
    {
        &self.bytes[..self.len]
    }
}

impl fmt::Write for LineBuffer
{
    fn write_str(&mut self, s: &str) -> fmt::Result
    {
        let available = LINE_CAPACITY - self.len;
        let take = s.len().min(available);
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Write all of `bytes` to `fd`, retrying on `EINTR` and short writes.
pub(crate) fn write_all(fd: c_int, mut bytes: &[u8])
{
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice of the given length
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return;
        }
        if written == 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Open the report file for appending. `None` when it cannot be opened.
pub(crate) fn open_report(path: &CStr) -> Option<c_int>
{
    // SAFETY: `path` is NUL-terminated
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    (fd >= 0).then_some(fd)
}

pub(crate) fn close(fd: c_int)
{
    // SAFETY: `fd` was returned by `open_report` and is closed once
    unsafe {
        libc::close(fd);
    }
}

/// Write `#<index> <frame>` lines followed by a blank line to every fd.
pub(crate) fn write_frames(fds: &[c_int], symbolicator: &Symbolicator<'_>, frames: &[RawFrame])
{
    let mut line = LineBuffer::new();
    for (index, frame) in frames.iter().enumerate() {
        line.clear();
        let resolved = symbolicator.resolve(*frame);
        let _ = write!(line, "#{index} ");
        let _ = render_frame(&mut line, frame.pc, resolved.function, resolved.filename, resolved.line);
        let _ = line.write_char('\n');
        for &fd in fds {
            write_all(fd, line.as_bytes());
        }
    }
    for &fd in fds {
        write_all(fd, b"\n");
    }
}

/// Full crash report: banner on stderr, frames on stderr and in the report
/// file, then a notice naming the report file.
pub(crate) fn write_report(
    signal: FaultSignal,
    symbolicator: &Symbolicator<'_>,
    frames: &[RawFrame],
    report_path: Option<&CStr>,
)
{
    let mut line = LineBuffer::new();
    // SAFETY: getpid is async-signal-safe and cannot fail
    let pid = unsafe { libc::getpid() };
    let _ = writeln!(
        line,
        "\nFatal signal {} ({}) received by process {pid}, native backtrace:",
        signal.name(),
        signal.number()
    );
    write_all(STDERR, line.as_bytes());

    let file = report_path.and_then(open_report);
    match file {
        Some(fd) => {
            write_frames(&[STDERR, fd], symbolicator, frames);
            close(fd);
        }
        None => write_frames(&[STDERR], symbolicator, frames),
    }

    if let (Some(_), Some(path)) = (file, report_path) {
        write_all(STDERR, b"crash report saved to ");
        write_all(STDERR, path.to_bytes());
        write_all(STDERR, b"\n");
    }
}

#[cfg(test)]
mod tests
{
    use std::ffi::CString;
    use std::fs;
    use std::os::unix::ffi::OsStrExt;

    use super::*;
    use crate::debug_info::IndexBuilder;
    use crate::types::Address;

    #[test]
    fn test_line_buffer_truncates()
    {
        let mut line = LineBuffer::new();
        let long = "x".repeat(LINE_CAPACITY + 10);
        line.write_str(&long).unwrap();
        assert_eq!(line.as_bytes().len(), LINE_CAPACITY);

        line.clear();
        write!(line, "#{} {}", 3, "main").unwrap();
        assert_eq!(line.as_bytes(), b"#3 main");
    }

    #[test]
    fn test_report_file_receives_frames_and_terminator()
    {
        let mut builder = IndexBuilder::new();
        builder.add_function(0x1000, 0x1100, 0, "app::crash");
        builder.add_line(0x1000, 0x1100, "src/app.rs", 9);
        let index = builder.finish(0);
        let symbolicator = Symbolicator::new(&index);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.log");
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        let frames = [
            RawFrame::exact(Address::new(0x1010)),
            RawFrame::return_address(Address::new(0x9000)),
        ];

        for _ in 0..2 {
            let fd = open_report(&c_path).unwrap();
            write_frames(&[fd], &symbolicator, &frames);
            close(fd);
        }

        let contents = fs::read_to_string(&path).unwrap();
        let report = "#0 app::crash at src/app.rs:9\n#1 ?? at 0x9000\n\n";
        assert_eq!(contents, format!("{report}{report}"));
    }

    #[test]
    fn test_open_report_fails_for_missing_directory()
    {
        let path = CString::new("/nonexistent/sigtrace/crash.log").unwrap();
        assert!(open_report(&path).is_none());
    }
}
