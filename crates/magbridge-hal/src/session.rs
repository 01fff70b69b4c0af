//! One configured TLV493D at one bus address.
//!
//! A session is created by [`SensorSession::initialize`], which echoes the
//! sensor's factory bits back and puts it into master-controlled mode, so
//! every subsequent [`SensorSession::read`] triggers a fresh conversion.
//!
//! A session that has seen one transfer error is dead: the driver must
//! rediscover the sensor and build a new one.

use magbridge_types::{BridgeError, DeviceAddress, Measurement};
use tracing::{debug, trace};

use crate::bus_port::BusPort;
use crate::codec::{self, READ_LEN, RESERVED_FIELDS, ReadBuffer, ReadField, WRITE_LEN, WriteBuffer, WriteField};

/// Live session state.
#[derive(Debug, Clone)]
pub struct SensorSession {
    address: DeviceAddress,
    write_buffer: WriteBuffer,
    read_buffer: ReadBuffer,
    failed: bool,
}

impl SensorSession {
    /// Configure the sensor at `address` and return a session bound to it.
    ///
    /// `address_select` is written into the two address-select bits of the
    /// configuration image.
    ///
    /// The configuration image goes out in two transfers, both at offset 0:
    /// bytes `0..3`, then byte 1 alone.  The sensor does not latch its mode
    /// reliably when the second transfer is folded into the first.
    ///
    /// # Errors
    ///
    /// Any [`BridgeError::Transfer`] from the bus.  The caller should treat
    /// it as "device not ready" and go back to discovery.
    pub fn initialize<B: BusPort + ?Sized>(
        bus: &mut B,
        address: DeviceAddress,
        address_select: u8,
    ) -> Result<Self, BridgeError> {
        let mut read_buffer = [0u8; READ_LEN];
        bus.read_block(address, 0, &mut read_buffer)?;

        let mut write_buffer = [0u8; WRITE_LEN];
        for (from, to) in RESERVED_FIELDS {
            codec::set(&mut write_buffer, to, codec::get(&read_buffer, from));
        }
        codec::set(&mut write_buffer, WriteField::Addr, address_select);
        codec::set(&mut write_buffer, WriteField::Parity, 1);
        codec::set(&mut write_buffer, WriteField::Fast, 1);
        codec::set(&mut write_buffer, WriteField::LowPower, 1);

        bus.write_block(address, 0, &write_buffer[0..3])?;
        bus.write_block(address, 0, &write_buffer[1..2])?;

        debug!(%address, config = ?write_buffer, "sensor configured");
        Ok(Self {
            address,
            write_buffer,
            read_buffer,
            failed: false,
        })
    }

    /// Trigger a conversion and decode the three axes.
    ///
    /// # Errors
    ///
    /// Any [`BridgeError::Transfer`] from the bus.  After the first failure
    /// the session refuses further reads without touching the bus.
    pub fn read<B: BusPort + ?Sized>(&mut self, bus: &mut B) -> Result<Measurement, BridgeError> {
        if self.failed {
            return Err(BridgeError::Transfer {
                address: self.address.raw(),
                details: "session abandoned after an earlier failure".to_string(),
            });
        }
        if let Err(e) = bus.read_block(self.address, 0, &mut self.read_buffer) {
            self.failed = true;
            return Err(e);
        }

        let image = &self.read_buffer;
        let m = Measurement {
            x_ut: codec::axis(image, ReadField::Bx1, ReadField::Bx2),
            y_ut: codec::axis(image, ReadField::By1, ReadField::By2),
            z_ut: codec::axis(image, ReadField::Bz1, ReadField::Bz2),
        };
        trace!(
            frame = codec::get(image, ReadField::FrameCounter),
            channel = codec::get(image, ReadField::Channel),
            "conversion read"
        );
        Ok(m)
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// The configuration image sent at initialisation.
    pub fn write_buffer(&self) -> &WriteBuffer {
        &self.write_buffer
    }

    /// Whether a read has failed on this session.
    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
