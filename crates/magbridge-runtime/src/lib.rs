//! `magbridge-runtime` – The Driver
//!
//! The execution engine that keeps the sensor visible on the pub/sub bus.
//!
//! # Modules
//!
//! - [`driver_loop`] – [`DriverLoop`][driver_loop::DriverLoop]: the
//!   Discovering / Polling / Terminating state machine that owns the bus,
//!   turns samples into a percentage of full scale, and absorbs every
//!   hardware fault into the device's error marker.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod driver_loop;
pub mod telemetry;

pub use driver_loop::{DriverConfig, DriverLoop, DriverState, MAX_BOUND_UT, format_percent};
pub use telemetry::{TracerProviderGuard, init_tracing};
