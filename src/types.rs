//! Range-checked types for OSDP addresses and sequence numbers.

use snafu::{ensure, OptionExt, Snafu};

use core::fmt;
use core::ops::Deref;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid 7-bit OSDP address.
    #[snafu(display("Invalid address"))]
    InvalidAddress,
    /// The value doesn't fit the 2-bit sequence field.
    #[snafu(display("Invalid sequence number"))]
    InvalidSequence,
}

const fn invalid_address() -> InvalidAddressSnafu {
    InvalidAddressSnafu
}

/// Address is a range-checked [0, 127] integer, identifying a peripheral on the bus.
///
/// ## Example
/// ```
/// use osdp_master::Address;
/// use std::convert::TryInto;
/// let addr = Address::new(10).unwrap();
/// let addr: Address = 10usize.try_into().unwrap();
/// assert!(Address::new(128).is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Address(u8);

/// Create a new [`Address`], panics if it is out of range.
pub const fn addr(a: u8) -> Address {
    if a <= Address::MAX {
        return Address(a);
    }
    panic!("Invalid address.")
}

impl Address {
    pub const MAX: u8 = 0x7F;
    /// Address every peripheral listens to.
    pub const BROADCAST: Address = Address(0x7F);
    /// Address a peripheral in configuration mode answers to.
    pub const CONFIGURATION: Address = Address(0x7D);

    /// Create a new address, checking that the address is in \[0, 127\].
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl TryInto<u8>) -> Result<Self, Error> {
        let address = address.try_into().ok().with_context(invalid_address)?;
        ensure!(address <= Self::MAX, invalid_address());
        Ok(Self(address))
    }

    /// Take the address from the wire byte, ignoring the reply flag in the top bit.
    pub const fn from_wire(byte: u8) -> Self {
        Self(byte & Self::MAX)
    }
}

impl Deref for Address {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait to convert `T: TryInto<u8>` into an [`Address`].
pub trait IntoAddress {
    /// Convert self to an Address.
    /// # Errors
    /// Returns `Error:InvalidAddress` if self isn't a valid address.
    fn into_address(self) -> Result<Address, Error>;
}

impl IntoAddress for Address {
    fn into_address(self) -> Result<Address, Error> {
        Ok(self)
    }
}

impl<T> IntoAddress for T
where
    T: TryInto<u8>,
{
    fn into_address(self) -> Result<Address, Error> {
        Address::new(self)
    }
}

impl TryFrom<usize> for Address {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// The 2-bit sequence number of the control byte.
///
/// In steady state it cycles 1, 2, 3, 1, ... The value 0 is only used to tell the
/// peripheral that the master lost track and the exchange starts over.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash, Default)]
#[repr(transparent)]
pub struct Sequence(u8);

impl Sequence {
    pub const RESYNC: Sequence = Sequence(0);
    const MASK: u8 = 0x03;

    /// # Errors
    /// Returns [`Error::InvalidSequence`] for values above 3.
    pub fn new(seq: u8) -> Result<Self, Error> {
        ensure!(seq <= Self::MASK, InvalidSequenceSnafu);
        Ok(Self(seq))
    }

    /// Extract the sequence number from a control byte.
    pub const fn from_control(control: u8) -> Self {
        Self(control & Self::MASK)
    }

    /// The sequence number following this one. Never returns [`Sequence::RESYNC`].
    pub const fn next(self) -> Self {
        if self.0 >= 3 {
            Self(1)
        } else {
            Self(self.0 + 1)
        }
    }

    pub const fn is_resync(self) -> bool {
        self.0 == 0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}
