//! Bus scan for the single responding sensor.
//!
//! The TLV493D's address depends on the level of an external strap at power
//! up, so it is located at runtime rather than configured.

use magbridge_types::{BridgeError, DeviceAddress};
use tracing::{debug, trace};

use crate::bus_port::BusPort;
use crate::codec::READ_LEN;

/// Number of addresses tried per scan.
pub const ADDRESS_SPACE: u8 = DeviceAddress::MAX + 1;

/// Try every 7-bit address in ascending order with a full-image read at
/// offset 0 and return the first one that answers.
///
/// # Errors
///
/// [`BridgeError::NoDeviceFound`] when no address responds.  Individual
/// failed trial reads are expected and never escape.
pub fn scan<B: BusPort + ?Sized>(bus: &mut B) -> Result<DeviceAddress, BridgeError> {
    let mut image = [0u8; READ_LEN];
    for raw in 0..=DeviceAddress::MAX {
        let Some(address) = DeviceAddress::new(raw) else {
            continue;
        };
        match bus.read_block(address, 0, &mut image) {
            Ok(()) => {
                debug!(%address, "sensor found");
                return Ok(address);
            }
            Err(e) => trace!(%address, error = %e, "no response"),
        }
    }
    Err(BridgeError::NoDeviceFound {
        scanned: ADDRESS_SPACE,
    })
}
