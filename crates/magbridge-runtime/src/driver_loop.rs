//! [`DriverLoop`] – discovery / initialisation / poll state machine.
//!
//! Each iteration performs at most one bus round-trip and then sleeps for
//! the poll interval:
//!
//! 1. **Discovering** – scan the bus and configure the first sensor that
//!    answers.  Any failure publishes the error marker and the loop stays
//!    here until the next interval.
//! 2. **Polling** – read one sample, publish the percentage of full scale.
//!    A failed read publishes the error marker and drops back to
//!    **Discovering**; the old address is never retried on its own.
//! 3. **Terminating** – entered once the shutdown flag is seen at an
//!    iteration boundary.  The virtual device is deleted and the transport
//!    stopped.
//!
//! Hardware errors never leave this module; they are logged and surfaced to
//! observers only through the retained error marker.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use magbridge_hal::sim::{SimBus, DEFAULT_ADDRESS};
//! use magbridge_middleware::RetainedBus;
//! use magbridge_runtime::driver_loop::{DriverConfig, DriverLoop, DriverState};
//!
//! let bus = RetainedBus::default();
//! let mut driver = DriverLoop::new(
//!     DriverConfig::new(1),
//!     SimBus::with_sensor(DEFAULT_ADDRESS),
//!     Arc::new(bus.clone()),
//! );
//! driver.step();
//! assert!(matches!(driver.state(), DriverState::Polling(_)));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use magbridge_hal::{BusPort, SensorSession, discovery};
use magbridge_middleware::{Transport, VirtualDevice};
use magbridge_types::Measurement;
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Datasheet full-scale bound of the sensor, in microtesla.
pub const MAX_BOUND_UT: f64 = 130_000.0;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const DEFAULT_DRIVER_NAME: &str = "tlv493d";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Validated, immutable driver settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Number of the `/dev/i2c-N` bus the sensor hangs off.
    pub bus_num: u32,
    pub poll_interval: Duration,
    /// Device name under `/devices/` on the pub/sub bus.
    pub driver_name: String,
    /// Address-select bits written at session initialisation (0..=3).
    pub address_select: u8,
}

impl DriverConfig {
    /// Defaults for everything but the bus number.
    pub fn new(bus_num: u32) -> Self {
        Self {
            bus_num,
            poll_interval: DEFAULT_POLL_INTERVAL,
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            address_select: 0,
        }
    }
}

/// Render a sample as the published percentage of full scale, two decimals.
pub fn format_percent(m: &Measurement) -> String {
    format!("{:.2}", 100.0 * m.max_abs() / MAX_BOUND_UT)
}

// ─────────────────────────────────────────────────────────────────────────────
// DriverLoop
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum DriverState {
    Discovering,
    Polling(SensorSession),
    Terminating,
}

/// Owns the bus exclusively and drives one virtual device.
pub struct DriverLoop<B: BusPort> {
    config: DriverConfig,
    bus: B,
    transport: Arc<dyn Transport>,
    device: Arc<VirtualDevice>,
    state: DriverState,
}

impl<B: BusPort> DriverLoop<B> {
    /// Build the loop and its virtual device.  The device registers for
    /// connection notifications here; nothing is published yet.
    pub fn new(config: DriverConfig, bus: B, transport: Arc<dyn Transport>) -> Self {
        let device = VirtualDevice::new(Arc::clone(&transport), config.driver_name.clone());
        Self {
            config,
            bus,
            transport,
            device,
            state: DriverState::Discovering,
        }
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<VirtualDevice> {
        &self.device
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Publish the device and its initial state: value `"0"`, error present.
    pub fn announce(&self) {
        self.device.create();
        let initial = self.device.state();
        self.device.publish_value(&initial.value);
        self.device.publish_error(initial.error);
    }

    /// Run one iteration without sleeping.
    pub fn step(&mut self) {
        let state = std::mem::replace(&mut self.state, DriverState::Discovering);
        self.state = match state {
            DriverState::Discovering => self.discover(),
            DriverState::Polling(session) => self.poll(session),
            DriverState::Terminating => DriverState::Terminating,
        };
    }

    /// Announce the device, then iterate until `shutdown` is set, sleeping
    /// one poll interval between iterations.  The flag is checked only at
    /// iteration boundaries.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) {
        info!(
            device = %self.config.driver_name,
            bus = self.config.bus_num,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "driver loop started"
        );
        self.announce();

        while !shutdown.load(Ordering::SeqCst) {
            self.step();
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        self.terminate();
    }

    /// Delete the virtual device and stop the transport.  Idempotent.
    pub fn terminate(&mut self) {
        if matches!(self.state, DriverState::Terminating) {
            return;
        }
        self.state = DriverState::Terminating;
        self.device.delete();
        self.transport.stop();
        info!(device = %self.config.driver_name, "driver loop stopped");
    }

    // -----------------------------------------------------------------------
    // State handlers
    // -----------------------------------------------------------------------

    fn discover(&mut self) -> DriverState {
        let address = match discovery::scan(&mut self.bus) {
            Ok(address) => address,
            Err(e) => {
                debug!(error = %e, "sensor not found");
                self.device.publish_error(true);
                return DriverState::Discovering;
            }
        };

        match SensorSession::initialize(&mut self.bus, address, self.config.address_select) {
            Ok(session) => {
                info!(%address, "sensor initialised");
                self.device.publish_error(false);
                DriverState::Polling(session)
            }
            Err(e) => {
                warn!(%address, error = %e, "sensor initialisation failed");
                self.device.publish_error(true);
                DriverState::Discovering
            }
        }
    }

    fn poll(&mut self, mut session: SensorSession) -> DriverState {
        match session.read(&mut self.bus) {
            Ok(m) => {
                let percent = format_percent(&m);
                debug!(x = m.x_ut, y = m.y_ut, z = m.z_ut, %percent, "sample");
                self.device.publish_value(&percent);
                DriverState::Polling(session)
            }
            Err(e) => {
                warn!(address = %session.address(), error = %e, "sensor read failed, rediscovering");
                self.device.publish_error(true);
                DriverState::Discovering
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use magbridge_hal::SimBus;
    use magbridge_hal::sim::DEFAULT_ADDRESS;
    use magbridge_middleware::RetainedBus;
    use magbridge_types::{DeviceAddress, Publication};
    use tokio::sync::broadcast;

    fn harness(sim: SimBus) -> (RetainedBus, DriverLoop<SimBus>) {
        let bus = RetainedBus::default();
        let mut config = DriverConfig::new(1);
        config.poll_interval = Duration::from_millis(10);
        let driver = DriverLoop::new(config, sim, Arc::new(bus.clone()));
        (bus, driver)
    }

    fn drain(rx: &mut broadcast::Receiver<Publication>) -> Vec<Publication> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[test]
    fn percent_of_full_scale_has_two_decimals() {
        let m = Measurement {
            x_ut: 65_000.0,
            y_ut: 0.0,
            z_ut: 0.0,
        };
        assert_eq!(format_percent(&m), "50.00");
    }

    #[test]
    fn percent_uses_largest_magnitude() {
        let m = Measurement {
            x_ut: 980.0,
            y_ut: -13_000.0,
            z_ut: 98.0,
        };
        assert_eq!(format_percent(&m), "10.00");
    }

    #[test]
    fn announce_publishes_defaults() {
        let (bus, driver) = harness(SimBus::new());
        driver.announce();
        let t = driver.device().topics();
        assert!(bus.retained(&t.device_meta).is_some());
        assert_eq!(bus.retained(&t.value).as_deref(), Some("0"));
        assert_eq!(bus.retained(&t.error).as_deref(), Some("r"));
    }

    #[test]
    fn discovery_exhaustion_stays_discovering() {
        let (bus, mut driver) = harness(SimBus::new());
        driver.announce();
        let mut rx = bus.subscribe();

        for _ in 0..3 {
            driver.step();
            assert!(matches!(driver.state(), DriverState::Discovering));
        }

        let error_topic = driver.device().topics().error.clone();
        let markers: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|p| p.topic == error_topic)
            .map(|p| p.payload)
            .collect();
        assert_eq!(markers, vec!["r", "r", "r"]);
    }

    #[test]
    fn found_sensor_clears_error_and_publishes_value() {
        let mut sim = SimBus::with_sensor(DEFAULT_ADDRESS);
        sim.set_field(98_000.0, 0.0, 0.0);
        let (bus, mut driver) = harness(sim);
        driver.announce();

        driver.step();
        match driver.state() {
            DriverState::Polling(session) => assert_eq!(session.address(), DEFAULT_ADDRESS),
            other => panic!("expected Polling, got {other:?}"),
        }
        let t = driver.device().topics().clone();
        assert_eq!(bus.retained(&t.error), None);

        driver.step();
        assert_eq!(bus.retained(&t.value).as_deref(), Some("75.38"));
    }

    #[test]
    fn initialisation_failure_stays_discovering() {
        let mut sim = SimBus::with_sensor(DEFAULT_ADDRESS);
        sim.reject_writes(true);
        let (bus, mut driver) = harness(sim);
        driver.announce();

        driver.step();
        assert!(matches!(driver.state(), DriverState::Discovering));
        assert_eq!(bus.retained(&driver.device().topics().error).as_deref(), Some("r"));

        driver.bus_mut().reject_writes(false);
        driver.step();
        assert!(matches!(driver.state(), DriverState::Polling(_)));
    }

    #[test]
    fn read_failure_triggers_full_rediscovery() {
        let (bus, mut driver) = harness(SimBus::with_sensor(DEFAULT_ADDRESS));
        driver.announce();
        driver.step();
        driver.step();

        let moved = DeviceAddress::new(0x1F).unwrap();
        driver.bus_mut().move_to(moved);
        driver.step();
        assert!(matches!(driver.state(), DriverState::Discovering));
        let error_topic = driver.device().topics().error.clone();
        assert_eq!(bus.retained(&error_topic).as_deref(), Some("r"));

        driver.step();
        match driver.state() {
            DriverState::Polling(session) => assert_eq!(session.address(), moved),
            other => panic!("expected Polling, got {other:?}"),
        }
        assert_eq!(bus.retained(&error_topic), None);
    }

    #[test]
    fn unplug_and_replug_recovers() {
        let (bus, mut driver) = harness(SimBus::with_sensor(DEFAULT_ADDRESS));
        driver.announce();
        driver.step();

        driver.bus_mut().detach();
        driver.step();
        driver.step();
        assert!(matches!(driver.state(), DriverState::Discovering));

        driver.bus_mut().attach(DEFAULT_ADDRESS);
        driver.bus_mut().set_field(0.0, 0.0, -13_034.0);
        driver.step();
        driver.step();
        let t = driver.device().topics();
        assert_eq!(bus.retained(&t.value).as_deref(), Some("10.03"));
        assert_eq!(bus.retained(&t.error), None);
    }

    #[test]
    fn terminate_is_idempotent() {
        let (bus, mut driver) = harness(SimBus::new());
        driver.announce();
        let mut rx = bus.subscribe();

        driver.terminate();
        driver.terminate();
        driver.step();

        assert!(matches!(driver.state(), DriverState::Terminating));
        assert!(bus.is_stopped());
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn shutdown_deletes_device_once_and_clears_topics() {
        let mut sim = SimBus::with_sensor(DEFAULT_ADDRESS);
        sim.set_field(65_000.0, 0.0, 0.0);
        let (bus, mut driver) = harness(sim);
        let topics = driver.device().topics().clone();
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            driver.run(flag).await;
            driver
        });

        let value_seen = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if bus.retained(&topics.value).as_deref().is_some_and(|v| v != "0") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(value_seen.is_ok(), "no sample was published");

        shutdown.store(true, Ordering::SeqCst);
        let driver = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop did not stop")
            .unwrap();

        assert!(matches!(driver.state(), DriverState::Terminating));
        assert_eq!(bus.retained(&topics.device_meta), None);
        assert_eq!(bus.retained(&topics.control_meta), None);
        assert_eq!(bus.retained(&topics.value), None);
        assert!(bus.is_stopped());
    }

    #[tokio::test]
    async fn preset_shutdown_never_touches_the_bus() {
        let (bus, mut driver) = harness(SimBus::with_sensor(DEFAULT_ADDRESS));
        let shutdown = Arc::new(AtomicBool::new(true));

        driver.run(shutdown).await;

        assert!(driver.bus_mut().operations().is_empty());
        assert_eq!(bus.retained(&driver.device().topics().value), None);
    }
}
