//! `magbridge-hal` – Sensor Hardware Layer
//!
//! Everything that touches the serial bus or the sensor's register layout.
//!
//! # Modules
//!
//! - [`codec`] – pure bitfield packing/unpacking over the 10-byte read image
//!   and the 4-byte configuration image, plus the 12-bit axis decoder.
//! - [`bus_port`] – [`BusPort`][bus_port::BusPort]: the narrow "block read /
//!   block write at offset" contract every bus transport implements.
//! - [`i2c`] – [`EmbeddedI2c`][i2c::EmbeddedI2c]: a [`BusPort`] over any
//!   `embedded-hal` I2C controller, and the Linux `/dev/i2c-N` opener.
//! - [`session`] – [`SensorSession`][session::SensorSession]: one configured
//!   sensor at one address.
//! - [`discovery`] – [`scan`][discovery::scan]: locates the single responding
//!   sensor on the bus.
//! - [`sim`] – [`SimBus`][sim::SimBus]: an in-process simulated bus for tests
//!   and hardware-free runs.

pub mod bus_port;
pub mod codec;
pub mod discovery;
pub mod i2c;
pub mod session;
pub mod sim;

pub use bus_port::BusPort;
pub use codec::{ReadField, WriteField};
pub use discovery::scan;
pub use i2c::EmbeddedI2c;
pub use session::SensorSession;
pub use sim::SimBus;
