//! In-process simulated bus for CI/CD testing without physical hardware.
//!
//! [`SimBus`] implements [`BusPort`] and hosts at most one simulated TLV493D
//! register file.  It records every transfer, lets tests move the sensor to
//! another address, unplug it, or inject transfer failures, so the whole
//! discovery / initialisation / poll cycle can run headless.
//!
//! # Example
//!
//! ```rust
//! use magbridge_hal::sim::{SimBus, DEFAULT_ADDRESS};
//! use magbridge_hal::{scan, SensorSession};
//!
//! let mut bus = SimBus::with_sensor(DEFAULT_ADDRESS);
//! bus.set_field(980.0, -98.0, 0.0);
//!
//! let address = scan(&mut bus).expect("sim sensor must answer");
//! let mut session = SensorSession::initialize(&mut bus, address, 0).unwrap();
//! let m = session.read(&mut bus).unwrap();
//! assert_eq!(m.x_ut, 980.0);
//! ```

use magbridge_types::{BridgeError, DeviceAddress};

use crate::bus_port::BusPort;
use crate::codec::{READ_LEN, ReadBuffer, SENSITIVITY_UT_PER_LSB, WRITE_LEN, WriteBuffer};

/// Factory address of the sensor with the address strap pulled high.
pub const DEFAULT_ADDRESS: DeviceAddress = match DeviceAddress::new(0x5E) {
    Some(addr) => addr,
    None => unreachable!(),
};

/// Register image of a freshly powered sensor: zero field, non-zero
/// reserved bits in bytes 7..9.
pub const FACTORY_IMAGE: ReadBuffer = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x5A, 0x0C];

/// One recorded bus transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Read { address: u8, offset: u8, len: usize },
    Write { address: u8, offset: u8, data: Vec<u8> },
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated sensor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimSensor {
    address: DeviceAddress,
    registers: ReadBuffer,
    config: WriteBuffer,
    configured: bool,
}

fn encode_axis(ut: f64) -> (u8, u8) {
    let raw = (ut / SENSITIVITY_UT_PER_LSB).round().clamp(-2048.0, 2047.0) as i16;
    let word = (raw << 4) as u16;
    ((word >> 8) as u8, ((word >> 4) & 0x0F) as u8)
}

// ────────────────────────────────────────────────────────────────────────────
// SimBus
// ────────────────────────────────────────────────────────────────────────────

/// A simulated bus.  Every transfer to an address with no sensor fails with
/// [`BridgeError::Transfer`], like a missing acknowledge on real hardware.
#[derive(Debug, Default)]
pub struct SimBus {
    sensor: Option<SimSensor>,
    operations: Vec<BusOp>,
    pending_failures: usize,
    reject_writes: bool,
}

impl SimBus {
    /// An empty bus with nothing attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with a factory-fresh sensor at `address`.
    pub fn with_sensor(address: DeviceAddress) -> Self {
        let mut bus = Self::new();
        bus.attach(address);
        bus
    }

    /// Plug a factory-fresh sensor in at `address`, replacing any existing
    /// one.
    pub fn attach(&mut self, address: DeviceAddress) {
        self.sensor = Some(SimSensor {
            address,
            registers: FACTORY_IMAGE,
            config: [0; WRITE_LEN],
            configured: false,
        });
    }

    /// Unplug the sensor.
    pub fn detach(&mut self) {
        self.sensor = None;
    }

    /// Move the attached sensor to another address, keeping its registers.
    /// The new strap setting drops any configuration it had latched.
    pub fn move_to(&mut self, address: DeviceAddress) {
        if let Some(sensor) = self.sensor.as_mut() {
            sensor.address = address;
            sensor.config = [0; WRITE_LEN];
            sensor.configured = false;
        }
    }

    /// Set the flux density the sensor will report, in microtesla.
    /// Values are quantised to the sensor's resolution and clamped to its
    /// 12-bit range.
    pub fn set_field(&mut self, x_ut: f64, y_ut: f64, z_ut: f64) {
        let Some(sensor) = self.sensor.as_mut() else {
            return;
        };
        let (x_top, x_low) = encode_axis(x_ut);
        let (y_top, y_low) = encode_axis(y_ut);
        let (z_top, z_low) = encode_axis(z_ut);
        let regs = &mut sensor.registers;
        regs[0] = x_top;
        regs[1] = y_top;
        regs[2] = z_top;
        regs[4] = (x_low << 4) | y_low;
        regs[5] = (regs[5] & 0xF0) | z_low;
    }

    /// Make the next `count` transfers fail regardless of address.
    pub fn fail_next(&mut self, count: usize) {
        self.pending_failures = count;
    }

    /// Make every write fail while reads keep working.
    pub fn reject_writes(&mut self, reject: bool) {
        self.reject_writes = reject;
    }

    /// The configuration image the sensor has latched, if it has been
    /// written since it was attached or moved.
    pub fn sensor_config(&self) -> Option<WriteBuffer> {
        self.sensor
            .as_ref()
            .filter(|s| s.configured)
            .map(|s| s.config)
    }

    /// Every transfer attempted so far, in order.
    pub fn operations(&self) -> &[BusOp] {
        &self.operations
    }

    pub fn clear_operations(&mut self) {
        self.operations.clear();
    }

    fn check(&mut self, address: DeviceAddress) -> Result<&mut SimSensor, BridgeError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(BridgeError::Transfer {
                address: address.raw(),
                details: "injected failure".to_string(),
            });
        }
        match self.sensor.as_mut() {
            Some(sensor) if sensor.address == address => Ok(sensor),
            _ => Err(BridgeError::Transfer {
                address: address.raw(),
                details: "no acknowledge".to_string(),
            }),
        }
    }
}

fn out_of_range(address: DeviceAddress, offset: u8, len: usize) -> BridgeError {
    BridgeError::Transfer {
        address: address.raw(),
        details: format!("register range {offset}+{len} out of bounds"),
    }
}

impl BusPort for SimBus {
    fn read_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        buf: &mut [u8],
    ) -> Result<(), BridgeError> {
        self.operations.push(BusOp::Read {
            address: address.raw(),
            offset,
            len: buf.len(),
        });
        let sensor = self.check(address)?;
        let start = usize::from(offset);
        let end = start + buf.len();
        if end > READ_LEN {
            return Err(out_of_range(address, offset, buf.len()));
        }
        buf.copy_from_slice(&sensor.registers[start..end]);
        Ok(())
    }

    fn write_block(
        &mut self,
        address: DeviceAddress,
        offset: u8,
        data: &[u8],
    ) -> Result<(), BridgeError> {
        self.operations.push(BusOp::Write {
            address: address.raw(),
            offset,
            data: data.to_vec(),
        });
        if self.reject_writes {
            return Err(BridgeError::Transfer {
                address: address.raw(),
                details: "write rejected".to_string(),
            });
        }
        let sensor = self.check(address)?;
        // No register pointer: the offset byte lands in register 0 and the
        // data follows it, as on the wire.
        let end = 1 + data.len();
        if end > WRITE_LEN {
            return Err(out_of_range(address, offset, data.len()));
        }
        sensor.config[0] = offset;
        sensor.config[1..end].copy_from_slice(data);
        sensor.configured = true;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
