//! Self-describing virtual device on the pub/sub bus.
//!
//! A [`VirtualDevice`] owns four retained topics under `/devices/<name>`:
//!
//! | Topic | Payload |
//! |---|---|
//! | `/devices/<name>/meta` | JSON device description |
//! | `/devices/<name>/controls/field/meta` | JSON control descriptor (`%`, read-only) |
//! | `/devices/<name>/controls/field` | percentage, two decimals |
//! | `/devices/<name>/controls/field/meta/error` | `"r"` while the sensor is unreadable, empty otherwise |
//!
//! All state changes, whether from the driver loop or from the transport's
//! connection notifications, go through one mutex, and each publish happens
//! while holding it.  A value update therefore never interleaves with a
//! reconnect republish.

use std::sync::{Arc, Mutex, MutexGuard};

use magbridge_types::{BridgeError, ConnectionEvent};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::Transport;

/// Name of the single control the device exposes.
pub const CONTROL_NAME: &str = "field";

/// Error-marker payload meaning "read error".
pub const ERROR_PRESENT: &str = "r";

/// Topic names for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub device_meta: String,
    pub control_meta: String,
    pub value: String,
    pub error: String,
}

impl DeviceTopics {
    pub fn new(driver_name: &str) -> Self {
        let device = format!("/devices/{driver_name}");
        let control = format!("{device}/controls/{CONTROL_NAME}");
        Self {
            device_meta: format!("{device}/meta"),
            control_meta: format!("{control}/meta"),
            error: format!("{control}/meta/error"),
            value: control,
        }
    }
}

/// What the device last told the bus, and whether the bus is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDeviceState {
    pub value: String,
    pub error: bool,
    pub connected: bool,
    pub created: bool,
}

impl VirtualDeviceState {
    fn new(connected: bool) -> Self {
        Self {
            value: "0".to_string(),
            error: true,
            connected,
            created: false,
        }
    }
}

pub struct VirtualDevice {
    transport: Arc<dyn Transport>,
    driver_name: String,
    topics: DeviceTopics,
    state: Mutex<VirtualDeviceState>,
    connection_rx: Mutex<Option<broadcast::Receiver<ConnectionEvent>>>,
}

impl VirtualDevice {
    /// Build a device and register for the transport's connection
    /// notifications.  Nothing is published until [`create`](Self::create).
    pub fn new(transport: Arc<dyn Transport>, driver_name: impl Into<String>) -> Arc<Self> {
        let driver_name = driver_name.into();
        let connection_rx = transport.subscribe_connection();
        let connected = transport.is_connected();
        Arc::new(Self {
            topics: DeviceTopics::new(&driver_name),
            driver_name,
            state: Mutex::new(VirtualDeviceState::new(connected)),
            connection_rx: Mutex::new(Some(connection_rx)),
            transport,
        })
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    /// A copy of the current state.
    pub fn state(&self) -> VirtualDeviceState {
        self.lock().clone()
    }

    /// Publish device and control metadata.  Safe to call repeatedly; each
    /// call publishes identical payloads.
    pub fn create(&self) {
        let mut state = self.lock();
        state.created = true;
        self.publish_meta(&mut state);
        info!(device = %self.driver_name, "virtual device created");
    }

    /// Record and publish a new value.
    pub fn publish_value(&self, value: &str) {
        let mut state = self.lock();
        state.value = value.to_string();
        self.send(&mut state, &self.topics.value, value);
    }

    /// Record and publish the error marker.
    pub fn publish_error(&self, present: bool) {
        let mut state = self.lock();
        state.error = present;
        self.send(&mut state, &self.topics.error, error_payload(present));
    }

    /// Clear the metadata and value topics.  The error marker is left as is.
    pub fn delete(&self) {
        let mut state = self.lock();
        self.send(&mut state, &self.topics.device_meta, "");
        self.send(&mut state, &self.topics.control_meta, "");
        self.send(&mut state, &self.topics.value, "");
        state.created = false;
        info!(device = %self.driver_name, "virtual device deleted");
    }

    /// Apply one connection notification.  Returns `true` when it caused a
    /// full republish, which happens only on a down-to-up transition of a
    /// created device.
    pub fn handle_connection_event(&self, event: ConnectionEvent) -> bool {
        let mut state = self.lock();
        match event {
            ConnectionEvent::Disconnected => {
                if state.connected {
                    debug!(device = %self.driver_name, "link down, publishes suspended");
                }
                state.connected = false;
                false
            }
            ConnectionEvent::Connected => {
                if state.connected {
                    return false;
                }
                state.connected = true;
                if !state.created {
                    return false;
                }
                info!(device = %self.driver_name, "link up, republishing state");
                self.republish(&mut state)
            }
        }
    }

    /// Re-read the link state from the transport and, when it is up,
    /// republish everything a created device owns regardless of the last
    /// state seen.  Used when connection notifications were dropped, since a
    /// lost down/up pair may have cost the broker its retained state.
    pub fn resync(&self) -> bool {
        let mut state = self.lock();
        state.connected = self.transport.is_connected();
        if !state.connected || !state.created {
            return false;
        }
        info!(device = %self.driver_name, "connection events missed, republishing state");
        self.republish(&mut state)
    }

    /// Spawn a task that applies every connection notification from the
    /// transport.  Only the first call starts a listener; later calls return
    /// a handle to a task that exits immediately.
    pub fn listen(self: Arc<Self>) -> JoinHandle<()> {
        let rx = self
            .connection_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                warn!(device = %self.driver_name, "connection listener already running");
                return;
            };
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        self.handle_connection_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(device = %self.driver_name, lagged_by = n, "connection events lagged");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, VirtualDeviceState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Metadata, value and error marker.  Returns whether the link survived.
    fn republish(&self, state: &mut VirtualDeviceState) -> bool {
        self.publish_meta(state);
        let value = state.value.clone();
        self.send(state, &self.topics.value, &value);
        let error = state.error;
        self.send(state, &self.topics.error, error_payload(error));
        state.connected
    }

    fn publish_meta(&self, state: &mut VirtualDeviceState) {
        let device_meta = json!({
            "driver": self.driver_name,
            "title": { "en": "TLV493D magnetic field" },
        });
        let control_meta = json!({
            "type": "value",
            "units": "%",
            "readonly": true,
            "order": 1,
            "title": { "en": "Field" },
        });
        self.send(state, &self.topics.device_meta, &device_meta.to_string());
        self.send(state, &self.topics.control_meta, &control_meta.to_string());
    }

    /// Publish one retained message unless the link is known to be down.
    fn send(&self, state: &mut VirtualDeviceState, topic: &str, payload: &str) {
        if !state.connected {
            return;
        }
        match self.transport.publish(topic, payload, true) {
            Ok(()) => {}
            Err(BridgeError::TransportDisconnected) => {
                debug!(topic, "link dropped during publish");
                state.connected = false;
            }
            Err(e) => warn!(topic, error = %e, "publish failed"),
        }
    }
}

fn error_payload(present: bool) -> &'static str {
    if present { ERROR_PRESENT } else { "" }
}
