//! Program counter type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed code address
///
/// This wrapper around `u64` keeps program counters apart from the other
/// `u64` values the unwinder juggles (stack pointers, biases, sizes).
///
/// Addresses captured at runtime are *runtime* addresses. The debug index
/// works on *file* addresses; [`Address::to_file_address`] converts between
/// the two using the image's load bias.
///
/// ## Example
///
/// ```rust
/// use sigtrace_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// let next_addr = addr + 0x100;
/// assert_eq!(next_addr.value(), 0x1100);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    ///
    /// Unwinding stops when it reaches a zero program counter.
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// This is equivalent to `Address::from(value)` but can be used in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    pub const fn is_zero(self) -> bool
    {
        self.0 == 0
    }

    /// Subtract an offset from this address, checking for underflow
    ///
    /// ## Example
    ///
    /// ```rust
    /// use sigtrace_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_sub(0x100), Some(Address::from(0xf00)));
    /// assert_eq!(addr.checked_sub(u64::MAX), None);
    /// ```
    pub const fn checked_sub(self, offset: u64) -> Option<Self>
    {
        match self.0.checked_sub(offset) {
            Some(value) => Some(Address(value)),
            None => None,
        }
    }

    /// Translate a runtime address into the file address space of an image
    /// loaded with the given bias.
    ///
    /// Returns `None` for addresses below the bias, which cannot belong to the image.
    pub const fn to_file_address(self, bias: u64) -> Option<u64>
    {
        self.0.checked_sub(bias)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
