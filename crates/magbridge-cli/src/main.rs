//! `magbridge` – TLV493D to pub/sub bridge service
//!
//! This binary:
//!
//! 1. Loads and validates the configuration; any problem exits with
//!    [`ExitStatus::NotConfigured`] before a virtual device exists.
//! 2. Opens `/dev/i2c-<bus_num>` (or the simulated sensor when
//!    `simulate = true`).
//! 3. Connects to the MQTT broker when `broker` is set, otherwise starts the
//!    in-process retained bus and its optional WebSocket bridge.  Then it
//!    starts the virtual device's connection listener.
//! 4. Runs the driver loop until SIGINT / SIGTERM, then deletes the device
//!    and exits with [`ExitStatus::Success`].
//!
//! ```text
//! magbridge [run] [--config PATH]
//! magbridge stop
//! ```

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use magbridge_hal::BusPort;
use magbridge_hal::sim::{DEFAULT_ADDRESS, SimBus};
use magbridge_middleware::{BrokerSettings, MqttTransport, RetainedBus, Transport, ws_bridge};
use magbridge_runtime::{DriverConfig, DriverLoop};
use magbridge_types::BridgeError;
use tracing::{error, info, warn};

const USAGE: &str = "usage: magbridge [run] [--config PATH] | magbridge stop";

/// How long queued publishes may take to reach the broker after stop.
const BROKER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Process exit codes, LSB init-script numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitStatus {
    Success = 0,
    Failure = 1,
    NotConfigured = 6,
    NotRunning = 7,
}

impl ExitStatus {
    /// Fatal errors are configuration problems; anything else that stops
    /// startup is a generic failure.
    fn for_error(err: &BridgeError) -> Self {
        if err.is_fatal() {
            ExitStatus::NotConfigured
        } else {
            ExitStatus::Failure
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status as u8)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run { config: Option<PathBuf> },
    Stop,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Command, String> {
    let mut args = args.into_iter().peekable();
    let mut config = None;

    match args.peek().map(String::as_str) {
        Some("stop") => {
            args.next();
            return match args.next() {
                None => Ok(Command::Stop),
                Some(extra) => Err(format!("unexpected argument {extra:?}")),
            };
        }
        Some("run") => {
            args.next();
        }
        _ => {}
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => return Err("--config needs a path".to_string()),
            },
            other => return Err(format!("unexpected argument {other:?}")),
        }
    }
    Ok(Command::Run { config })
}

fn main() -> ExitCode {
    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("magbridge: {msg}");
            eprintln!("{USAGE}");
            return ExitStatus::Failure.into();
        }
    };

    let _guard = magbridge_runtime::init_tracing("magbridge");

    let status = match command {
        Command::Stop => {
            info!("stop requested; the service runs in the foreground, nothing to stop");
            ExitStatus::NotRunning
        }
        Command::Run { config } => run(config),
    };
    status.into()
}

fn run(config_path: Option<PathBuf>) -> ExitStatus {
    let (cfg, driver_config, broker) = match config::load(config_path.as_deref()).and_then(|cfg| {
        let driver = cfg.validate()?;
        let broker = cfg.broker_settings(&driver)?;
        Ok((cfg, driver, broker))
    }) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return ExitStatus::for_error(&e);
        }
    };

    let bus = match open_bus(&cfg, &driver_config) {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "cannot open sensor bus");
            return ExitStatus::for_error(&e);
        }
    };

    // ── Shutdown flag ─────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install signal handler; stop with SIGKILL only");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitStatus::Failure;
        }
    };

    runtime.block_on(serve(cfg, driver_config, broker, bus, shutdown))
}

fn open_bus(cfg: &config::Config, driver: &DriverConfig) -> Result<Box<dyn BusPort>, BridgeError> {
    if cfg.simulate {
        info!(address = %DEFAULT_ADDRESS, "using simulated sensor");
        let mut sim = SimBus::with_sensor(DEFAULT_ADDRESS);
        sim.set_field(24_500.0, -3_920.0, 1_960.0);
        return Ok(Box::new(sim));
    }
    open_hardware_bus(driver.bus_num)
}

#[cfg(target_os = "linux")]
fn open_hardware_bus(bus_num: u32) -> Result<Box<dyn BusPort>, BridgeError> {
    let port = magbridge_hal::i2c::open_linux_bus(bus_num)?;
    info!(bus = bus_num, "opened i2c bus");
    Ok(Box::new(port))
}

#[cfg(not(target_os = "linux"))]
fn open_hardware_bus(bus_num: u32) -> Result<Box<dyn BusPort>, BridgeError> {
    Err(BridgeError::Configuration(format!(
        "i2c bus {bus_num} needs Linux i2c-dev; set simulate = true on this platform"
    )))
}

async fn serve(
    cfg: config::Config,
    driver_config: DriverConfig,
    broker: Option<BrokerSettings>,
    bus: Box<dyn BusPort>,
    shutdown: Arc<AtomicBool>,
) -> ExitStatus {
    let mut ws_server = None;
    let mut broker_link = None;

    let transport: Arc<dyn Transport> = match broker {
        Some(settings) => {
            if cfg.ws_listen.is_some() {
                warn!("ws_listen ignored: the ws bridge only serves the in-process bus");
            }
            let (mqtt, event_loop) = MqttTransport::start(&settings);
            broker_link = Some(event_loop);
            mqtt
        }
        None => {
            let local = RetainedBus::default();
            if let Some(addr) = cfg.ws_listen {
                match ws_bridge::serve(local.clone(), addr).await {
                    Ok(server) => ws_server = Some(server),
                    Err(e) => {
                        error!(error = %e, "cannot start ws bridge");
                        return ExitStatus::for_error(&e);
                    }
                }
            }
            Arc::new(local)
        }
    };

    let mut driver = DriverLoop::new(driver_config, bus, transport);
    let listener = Arc::clone(driver.device()).listen();

    driver.run(shutdown).await;

    listener.abort();
    if let Some(server) = ws_server {
        server.abort();
    }
    if let Some(event_loop) = broker_link
        && tokio::time::timeout(BROKER_FLUSH_TIMEOUT, event_loop).await.is_err()
    {
        warn!("broker did not acknowledge shutdown in time");
    }
    ExitStatus::Success
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_means_run_with_default_config() {
        assert_eq!(parse_args(args(&[])), Ok(Command::Run { config: None }));
        assert_eq!(parse_args(args(&["run"])), Ok(Command::Run { config: None }));
    }

    #[test]
    fn config_flag_is_accepted_with_or_without_run() {
        let expected = Ok(Command::Run {
            config: Some(PathBuf::from("/tmp/m.toml")),
        });
        assert_eq!(parse_args(args(&["--config", "/tmp/m.toml"])), expected);
        assert_eq!(parse_args(args(&["run", "-c", "/tmp/m.toml"])), expected);
    }

    #[test]
    fn stop_is_its_own_command() {
        assert_eq!(parse_args(args(&["stop"])), Ok(Command::Stop));
        assert!(parse_args(args(&["stop", "now"])).is_err());
    }

    #[test]
    fn unknown_or_incomplete_arguments_are_rejected() {
        assert!(parse_args(args(&["restart"])).is_err());
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["run", "--verbose"])).is_err());
    }

    #[test]
    fn exit_codes_follow_init_script_numbering() {
        assert_eq!(ExitStatus::Success as u8, 0);
        assert_eq!(ExitStatus::Failure as u8, 1);
        assert_eq!(ExitStatus::NotConfigured as u8, 6);
        assert_eq!(ExitStatus::NotRunning as u8, 7);
    }

    #[test]
    fn simulate_opens_the_simulated_sensor() {
        let cfg: config::Config = toml::from_str("bus_num = 9\nsimulate = true").unwrap();
        let driver = cfg.validate().unwrap();
        let mut bus = open_bus(&cfg, &driver).unwrap();
        assert_eq!(magbridge_hal::scan(&mut bus).unwrap(), DEFAULT_ADDRESS);
    }

    #[test]
    fn fatal_errors_map_to_not_configured() {
        assert_eq!(
            ExitStatus::for_error(&BridgeError::Configuration("bus_num is required".to_string())),
            ExitStatus::NotConfigured
        );
        assert_eq!(
            ExitStatus::for_error(&BridgeError::Transport("ws bind error".to_string())),
            ExitStatus::Failure
        );
    }

    #[tokio::test]
    async fn serve_with_preset_shutdown_exits_successfully() {
        let cfg: config::Config = toml::from_str("bus_num = 9\nsimulate = true").unwrap();
        let driver = cfg.validate().unwrap();
        let bus = open_bus(&cfg, &driver).unwrap();
        let status = serve(cfg, driver, None, bus, Arc::new(AtomicBool::new(true))).await;
        assert_eq!(status, ExitStatus::Success);
    }

    #[tokio::test]
    async fn ws_bind_failure_is_a_generic_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let cfg: config::Config =
            toml::from_str(&format!("bus_num = 9\nsimulate = true\nws_listen = \"{addr}\"")).unwrap();
        let driver = cfg.validate().unwrap();
        let bus = open_bus(&cfg, &driver).unwrap();
        let status = serve(cfg, driver, None, bus, Arc::new(AtomicBool::new(true))).await;
        assert_eq!(status, ExitStatus::Failure);
    }

    #[tokio::test]
    async fn serve_with_unreachable_broker_still_shuts_down() {
        let port = {
            let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            closed.local_addr().unwrap().port()
        };
        let cfg: config::Config =
            toml::from_str(&format!("bus_num = 9\nsimulate = true\nbroker = \"127.0.0.1:{port}\"")).unwrap();
        let driver = cfg.validate().unwrap();
        let broker = cfg.broker_settings(&driver).unwrap();
        let bus = open_bus(&cfg, &driver).unwrap();
        let status = serve(cfg, driver, broker, bus, Arc::new(AtomicBool::new(true))).await;
        assert_eq!(status, ExitStatus::Success);
    }
}
