//! # Backtrace State
//!
//! A [`BacktraceState`] owns the debug information of one binary image and
//! the unwind tables of the process, loaded at most once and shared
//! read-only afterwards.
//!
//! ## Loading modes
//!
//! - **Threaded**: the image is parsed on first use. Concurrent first users
//!   block until the parse finishes; every later access is a lock-free read.
//! - **Non-threaded**: the image is parsed inside [`BacktraceState::create`].
//!
//! Either way the fault handler calls [`BacktraceState::warm`] before it is
//! armed, so nothing is ever parsed inside a signal handler.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fmt};

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::debug_info::{DebugIndex, DebugInfoReader};
use crate::error::{BacktraceError, Result};
use crate::platform;
use crate::symbolize::Symbolicator;
use crate::types::{Address, Frame, RawFrame, MAX_FRAMES};
use crate::unwind::{UnwindTables, Unwinder};

/// Parsed image: debug index plus unwind tables.
pub struct ProcessImage
{
    index: DebugIndex,
    tables: UnwindTables,
}

impl ProcessImage
{
    /// Parse the image at `path` and snapshot the unwind tables of every
    /// object currently loaded into the process.
    pub fn load(path: &Path) -> Self
    {
        let objects = platform::loaded_objects();
        let bias = platform::image_bias(&objects, path);
        let index = DebugInfoReader::new(path, bias).read();
        let tables = UnwindTables::from_objects(&objects);
        Self { index, tables }
    }

    pub fn index(&self) -> &DebugIndex
    {
        &self.index
    }

    pub fn tables(&self) -> &UnwindTables
    {
        &self.tables
    }

    pub fn symbolicator(&self) -> Symbolicator<'_>
    {
        Symbolicator::new(&self.index)
    }

    pub fn unwinder(&self) -> Unwinder<'_>
    {
        Unwinder::new(&self.tables)
    }
}

impl fmt::Debug for ProcessImage
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ProcessImage")
            .field("functions", &self.index.function_count())
            .field("lines", &self.index.line_count())
            .field("symbols", &self.index.symbol_count())
            .field("tables", &self.tables)
            .finish()
    }
}

/// Cached debug information for one binary image.
///
/// Created with [`BacktraceState::create`]; cheap to share by reference across
/// threads.
#[derive(Debug)]
pub struct BacktraceState
{
    path: PathBuf,
    threaded: bool,
    image: OnceCell<Arc<ProcessImage>>,
}

impl BacktraceState
{
    /// Create a state for `filename`, or for the current executable when
    /// `filename` is `None`.
    ///
    /// ## Errors
    ///
    /// - [`BacktraceError::Unsupported`] when native unwinding is not available on this target
    /// - [`BacktraceError::ImageNotFound`] when the image does not exist
    /// - [`BacktraceError::Initialization`] when the image cannot be opened
    pub fn create(filename: Option<&Path>, threaded: bool) -> Result<Self>
    {
        if !platform::SUPPORTED {
            return Err(BacktraceError::unsupported());
        }

        let path = match filename {
            Some(path) => path.to_path_buf(),
            None => env::current_exe()
                .map_err(|err| BacktraceError::Initialization(format!("cannot locate the current executable: {err}")))?,
        };
        check_image(&path)?;

        let state = Self {
            path,
            threaded,
            image: OnceCell::new(),
        };
        if !threaded {
            state.warm();
        }
        debug!(path = %state.path.display(), threaded, "created backtrace state");
        Ok(state)
    }

    /// Path of the binary image this state describes.
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    pub fn is_threaded(&self) -> bool
    {
        self.threaded
    }

    /// Whether the image has been parsed already.
    pub fn is_loaded(&self) -> bool
    {
        self.image.get().is_some()
    }

    /// Parse the image if that has not happened yet and return it.
    pub fn warm(&self) -> Arc<ProcessImage>
    {
        Arc::clone(self.image.get_or_init(|| {
            let image = ProcessImage::load(&self.path);
            debug!(path = %self.path.display(), image = ?image, "loaded process image");
            Arc::new(image)
        }))
    }

    /// Capture the call stack of the caller, innermost frame first.
    ///
    /// The frame of `capture` itself is never included; `skip` drops that
    /// many more frames. At most [`MAX_FRAMES`] frames are returned. An empty
    /// vector means unwinding could not start.
    #[inline(never)]
    pub fn capture(&self, skip: usize) -> Vec<Frame>
    {
        let image = self.warm();
        let mut raw = [RawFrame::EMPTY; MAX_FRAMES];
        let count = image.unwinder().trace_current(skip.saturating_add(1), &mut raw);

        let symbolicator = image.symbolicator();
        raw[..count].iter().map(|frame| symbolicator.frame(*frame)).collect()
    }

    /// Resolve a single address of this image.
    ///
    /// `pc` is treated as an exact instruction address, not a return address.
    pub fn resolve(&self, pc: Address) -> Frame
    {
        self.warm().symbolicator().frame(RawFrame::exact(pc))
    }
}

/// Make sure `path` names a readable regular file.
fn check_image(path: &Path) -> Result<()>
{
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(BacktraceError::ImageNotFound(path.to_path_buf())),
        Err(err) => return Err(BacktraceError::Initialization(format!("{}: {err}", path.display()))),
    };
    if !metadata.is_file() {
        return Err(BacktraceError::Initialization(format!(
            "{}: not a regular file",
            path.display()
        )));
    }
    File::open(path).map_err(|err| BacktraceError::Initialization(format!("{}: {err}", path.display())))?;
    Ok(())
}

static DEFAULT_STATE: OnceCell<Option<BacktraceState>> = OnceCell::new();

/// Process-wide state for the current executable, created on first use.
///
/// `None` when native backtraces are unavailable; the reason is logged once.
pub fn default_state() -> Option<&'static BacktraceState>
{
    DEFAULT_STATE
        .get_or_init(|| match BacktraceState::create(None, true) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(error = %err, "native backtraces unavailable");
                None
            }
        })
        .as_ref()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_missing_image_is_not_found()
    {
        let err = BacktraceState::create(Some(Path::new("/nonexistent/sigtrace-image")), true).unwrap_err();
        if platform::SUPPORTED {
            assert!(matches!(err, BacktraceError::ImageNotFound(_)));
        } else {
            assert!(matches!(err, BacktraceError::Unsupported { .. }));
        }
        assert!(err.is_initialization_error());
    }

    #[test]
    fn test_directory_is_rejected()
    {
        let dir = tempfile::tempdir().unwrap();
        let err = BacktraceState::create(Some(dir.path()), true).unwrap_err();
        assert!(err.is_initialization_error());
    }

    #[test]
    fn test_loading_modes()
    {
        if !platform::SUPPORTED {
            return;
        }
        let lazy = BacktraceState::create(None, true).unwrap();
        assert!(lazy.is_threaded());
        assert!(!lazy.is_loaded());
        lazy.warm();
        assert!(lazy.is_loaded());

        let eager = BacktraceState::create(None, false).unwrap();
        assert!(eager.is_loaded());
        assert_eq!(eager.path(), env::current_exe().unwrap());
    }

    #[test]
    fn test_warm_returns_the_same_image()
    {
        if !platform::SUPPORTED {
            return;
        }
        let state = BacktraceState::create(None, true).unwrap();
        assert!(Arc::ptr_eq(&state.warm(), &state.warm()));
    }

    #[test]
    fn test_default_state_is_shared()
    {
        let first = default_state().map(|state| state as *const BacktraceState);
        let second = default_state().map(|state| state as *const BacktraceState);
        assert_eq!(first, second);
        assert_eq!(first.is_some(), platform::SUPPORTED);
    }
}
