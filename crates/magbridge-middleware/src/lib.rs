//! `magbridge-middleware` – Pub/Sub Side
//!
//! Everything between the driver loop and the outside world's message bus.
//!
//! # Modules
//!
//! - [`transport`] – the [`Transport`] contract: retained publish,
//!   connection-notification subscription, stop.
//! - [`bus`] – [`RetainedBus`]: an in-process retained-message broker built
//!   on Tokio broadcast channels.
//! - [`mqtt`] – [`MqttTransport`]: the same contract over an MQTT broker.
//! - [`virtual_device`] – [`VirtualDevice`]: the self-describing device whose
//!   metadata, value and error marker live on retained topics.
//! - [`ws_bridge`] – a WebSocket endpoint exposing the retained bus to
//!   external clients as JSON.

pub mod bus;
pub mod mqtt;
pub mod transport;
pub mod virtual_device;
pub mod ws_bridge;

pub use bus::RetainedBus;
pub use mqtt::{BrokerSettings, MqttTransport};
pub use transport::Transport;
pub use virtual_device::{DeviceTopics, VirtualDevice, VirtualDeviceState};
