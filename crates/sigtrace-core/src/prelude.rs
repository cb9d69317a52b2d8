//! Common module for library exports

pub use crate::config::FaultHandlerConfig;
pub use crate::error::{BacktraceError, Result};
pub use crate::fault::{FaultSignal, SignalSet};
pub use crate::state::BacktraceState;
pub use crate::types::address::Address;
pub use crate::types::frame::{Frame, RawFrame};
