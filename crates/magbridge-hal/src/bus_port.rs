//! Generic `BusPort` trait for byte-oriented register buses.
//!
//! The driver only ever needs two operations: read a block of consecutive
//! registers starting at an offset, and write a block starting at an offset.
//! Concrete transports ([`EmbeddedI2c`][crate::i2c::EmbeddedI2c],
//! [`SimBus`][crate::sim::SimBus]) implement this trait so the session and
//! discovery logic never see the underlying device.
//!
//! A `BusPort` is a serialized resource: it is owned by exactly one driver
//! loop and every method takes `&mut self`.

use magbridge_types::{BridgeError, DeviceAddress};

/// A shared serial bus addressed by 7-bit device addresses.
pub trait BusPort: Send {
    /// Fill `buf` with `buf.len()` bytes read from `address`, starting at
    /// register `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transfer`] if the device does not acknowledge
    /// or the transfer is interrupted.
    fn read_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        buf: &mut [u8],
    ) -> Result<(), BridgeError>;

    /// Write `data` to `address`, starting at register `offset`, as one
    /// transfer.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transfer`] if the transfer fails.
    fn write_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        data: &[u8],
    ) -> Result<(), BridgeError>;
}

impl<B: BusPort + ?Sized> BusPort for Box<B> {
    fn read_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        buf: &mut [u8],
    ) -> Result<(), BridgeError> {
        (**self).read_block(address, offset, buf)
    }

    fn write_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        data: &[u8],
    ) -> Result<(), BridgeError> {
        (**self).write_block(address, offset, data)
    }
}
