//! # Types
//!
//! Plain data types shared by the unwinder, the symbolicator and the public API.

pub mod address;
pub mod frame;

pub use address::Address;
pub use frame::{Frame, RawFrame, UNKNOWN_FUNCTION};

/// Maximum number of frames recorded by one unwind.
///
/// Deeper stacks are silently truncated.
pub const MAX_FRAMES: usize = 128;
