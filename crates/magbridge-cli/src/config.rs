//! Service configuration – reads `/etc/magbridge.toml` (or the path given on
//! the command line / in `MAGBRIDGE_CONFIG`).
//!
//! ```toml
//! bus_num = 1
//! poll_interval_s = 0.5
//! driver_name = "tlv493d"
//! address_select = 0
//! simulate = false
//! broker = "tcp://localhost:1883"
//! ```
//!
//! Without `broker` the service publishes to the in-process retained bus,
//! which `ws_listen` can expose over WebSocket.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use magbridge_middleware::BrokerSettings;
use magbridge_runtime::DriverConfig;
use magbridge_runtime::driver_loop::DEFAULT_DRIVER_NAME;
use magbridge_types::BridgeError;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/magbridge.toml";

/// Highest value the two address-select bits can hold.
const MAX_ADDRESS_SELECT: u8 = 3;

/// The configuration file as written.  Turn it into a [`DriverConfig`] with
/// [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// `/dev/i2c-N` bus number.  Required; kept optional here so a missing
    /// value is reported as a configuration error rather than a parse error.
    #[serde(default)]
    pub bus_num: Option<u32>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: f64,

    #[serde(default = "default_driver_name")]
    pub driver_name: String,

    #[serde(default)]
    pub address_select: u8,

    /// Run against the in-process simulated sensor instead of hardware.
    #[serde(default)]
    pub simulate: bool,

    /// MQTT broker URL.  When absent the in-process bus is used.
    #[serde(default)]
    pub broker: Option<String>,

    /// Where to serve the WebSocket view of the in-process bus.  Disabled
    /// when absent.
    #[serde(default)]
    pub ws_listen: Option<SocketAddr>,
}

fn default_poll_interval() -> f64 {
    0.5
}
fn default_driver_name() -> String {
    DEFAULT_DRIVER_NAME.to_string()
}

impl Config {
    /// Check every field and produce the immutable driver settings.
    pub fn validate(&self) -> Result<DriverConfig, BridgeError> {
        let bus_num = self
            .bus_num
            .ok_or_else(|| BridgeError::Configuration("bus_num is required".to_string()))?;

        if !self.poll_interval_s.is_finite() || self.poll_interval_s <= 0.0 {
            return Err(BridgeError::Configuration(format!(
                "poll_interval_s must be a positive number of seconds, got {}",
                self.poll_interval_s
            )));
        }
        let poll_interval = Duration::try_from_secs_f64(self.poll_interval_s).map_err(|e| {
            BridgeError::Configuration(format!(
                "poll_interval_s {} is out of range: {e}",
                self.poll_interval_s
            ))
        })?;

        let driver_name = self.driver_name.trim();
        if driver_name.is_empty() {
            return Err(BridgeError::Configuration("driver_name must not be empty".to_string()));
        }
        if driver_name.contains(['/', '+', '#']) {
            return Err(BridgeError::Configuration(format!(
                "driver_name {driver_name:?} must not contain '/', '+' or '#'"
            )));
        }

        if self.address_select > MAX_ADDRESS_SELECT {
            return Err(BridgeError::Configuration(format!(
                "address_select must be 0..={MAX_ADDRESS_SELECT}, got {}",
                self.address_select
            )));
        }

        Ok(DriverConfig {
            bus_num,
            poll_interval,
            driver_name: driver_name.to_string(),
            address_select: self.address_select,
        })
    }

    /// Broker connection settings, `None` for the in-process bus.  The MQTT
    /// client id is derived from the driver name.
    pub fn broker_settings(&self, driver: &DriverConfig) -> Result<Option<BrokerSettings>, BridgeError> {
        self.broker
            .as_deref()
            .map(|url| BrokerSettings::parse(url, format!("magbridge-{}", driver.driver_name)))
            .transpose()
    }
}

/// Pick the config file: command line, then `MAGBRIDGE_CONFIG`, then
/// [`DEFAULT_CONFIG_PATH`].
pub fn resolve_path(cli: Option<&Path>) -> PathBuf {
    resolve_path_with(cli, std::env::var("MAGBRIDGE_CONFIG").ok())
}

fn resolve_path_with(cli: Option<&Path>, env: Option<String>) -> PathBuf {
    match (cli, env) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(e)) if !e.is_empty() => PathBuf::from(e),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

/// Resolve, read, and apply environment overrides.
pub fn load(cli: Option<&Path>) -> Result<Config, BridgeError> {
    let path = resolve_path(cli);
    let mut cfg = load_from(&path)?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`.  A missing file is a configuration error.
pub fn load_from(path: &Path) -> Result<Config, BridgeError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Configuration(format!("cannot read config at {}: {e}", path.display()))
    })?;
    toml::from_str(&raw).map_err(|e| {
        BridgeError::Configuration(format!("cannot parse config at {}: {e}", path.display()))
    })
}

/// Apply `MAGBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MAGBRIDGE_BUS_NUM` | `bus_num` |
/// | `MAGBRIDGE_POLL_INTERVAL` | `poll_interval_s` |
/// | `MAGBRIDGE_DRIVER_NAME` | `driver_name` |
/// | `MAGBRIDGE_BROKER` | `broker` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("MAGBRIDGE_BUS_NUM")
        && let Ok(n) = v.trim().parse::<u32>()
    {
        cfg.bus_num = Some(n);
    }
    if let Some(v) = lookup("MAGBRIDGE_POLL_INTERVAL")
        && let Ok(s) = v.trim().parse::<f64>()
    {
        cfg.poll_interval_s = s;
    }
    if let Some(v) = lookup("MAGBRIDGE_DRIVER_NAME") {
        cfg.driver_name = v;
    }
    if let Some(v) = lookup("MAGBRIDGE_BROKER") {
        cfg.broker = Some(v.trim().to_string()).filter(|b| !b.is_empty());
    }
}
