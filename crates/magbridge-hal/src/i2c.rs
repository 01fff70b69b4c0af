//! [`BusPort`] over an `embedded-hal` I2C controller.
//!
//! Register offsets follow SMBus "I2C block" framing: the offset is sent as
//! the first byte of a write, and a block read is a write of the offset
//! followed by a repeated-start read.

use embedded_hal::i2c::I2c;
use magbridge_types::{BridgeError, DeviceAddress};

use crate::bus_port::BusPort;

/// Adapter turning any `embedded_hal::i2c::I2c` controller into a
/// [`BusPort`].
pub struct EmbeddedI2c<T> {
    i2c: T,
    frame: Vec<u8>,
}

impl<T: I2c> EmbeddedI2c<T> {
    pub fn new(i2c: T) -> Self {
        Self {
            i2c,
            frame: Vec::new(),
        }
    }

    /// Give back the wrapped controller.
    pub fn release(self) -> T {
        self.i2c
    }
}

fn transfer_error<E: embedded_hal::i2c::Error>(address: DeviceAddress, err: E) -> BridgeError {
    BridgeError::Transfer {
        address: address.raw(),
        details: format!("{:?}", err.kind()),
    }
}

impl<T: I2c + Send> BusPort for EmbeddedI2c<T> {
    fn read_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        buf: &mut [u8],
    ) -> Result<(), BridgeError> {
        self.i2c
            .write_read(address.raw(), &[offset], buf)
            .map_err(|e| transfer_error(address, e))
    }

    fn write_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        data: &[u8],
    ) -> Result<(), BridgeError> {
        self.frame.clear();
        self.frame.push(offset);
        self.frame.extend_from_slice(data);
        self.i2c
            .write(address.raw(), &self.frame)
            .map_err(|e| transfer_error(address, e))
    }
}

/// Open `/dev/i2c-<bus_num>`.
///
/// # Errors
///
/// Returns [`BridgeError::Configuration`] when the device node cannot be
/// opened; an unreachable bus is a configuration problem, not a sensor fault.
#[cfg(target_os = "linux")]
pub fn open_linux_bus(
    bus_num: u32,
) -> Result<EmbeddedI2c<linux_embedded_hal::I2cdev>, BridgeError> {
    let path = format!("/dev/i2c-{bus_num}");
    linux_embedded_hal::I2cdev::new(&path)
        .map(EmbeddedI2c::new)
        .map_err(|e| BridgeError::Configuration(format!("cannot open {path}: {e}")))
}
