//! [`Transport`] over an MQTT broker.
//!
//! [`MqttTransport::start`] builds a `rumqttc` client and spawns its event
//! loop.  The loop owns the socket: it reconnects on its own after a
//! failure, and every ConnAck / connection error is turned into a
//! [`ConnectionEvent`] for the virtual device.  Publishing never awaits; a
//! message is queued to the event loop and refused outright while the link
//! is down.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), magbridge_types::BridgeError> {
//! use magbridge_middleware::mqtt::{BrokerSettings, MqttTransport};
//!
//! let settings = BrokerSettings::parse("tcp://localhost:1883", "magbridge-tlv493d")?;
//! let (transport, event_loop) = MqttTransport::start(&settings);
//! # let _ = (transport, event_loop);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use magbridge_types::{BridgeError, ConnectionEvent};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::Transport;

pub const DEFAULT_PORT: u16 = 1883;

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Capacity of the connection-notification channel.
const EVENT_CAPACITY: usize = 16;

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Pause between a connection error and the next attempt.
    pub reconnect_delay: Duration,
}

impl BrokerSettings {
    /// Parse `tcp://host:port`, `mqtt://host:port`, `host:port` or a bare
    /// `host` (port 1883).
    ///
    /// # Errors
    ///
    /// [`BridgeError::Configuration`] for another scheme, an empty host or a
    /// port that is not a number.
    pub fn parse(url: &str, client_id: impl Into<String>) -> Result<Self, BridgeError> {
        let invalid = |why: &str| BridgeError::Configuration(format!("broker {url:?}: {why}"));

        let rest = match url.trim().split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {scheme:?}"))),
            None => url.trim(),
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| invalid("port must be 0..=65535"))?,
            ),
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            client_id: client_id.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }
}

/// Link state shared between the client handle and the event-loop task.
struct Link {
    connected: AtomicBool,
    stopped: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Link {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            events,
        }
    }

    /// Emits [`ConnectionEvent::Connected`] only on a down-to-up change.
    fn up(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("broker link up");
            let _ = self.events.send(ConnectionEvent::Connected);
        }
    }

    /// Emits [`ConnectionEvent::Disconnected`] only on an up-to-down change.
    fn down(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("broker link down");
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A retained-message link to an MQTT broker.
pub struct MqttTransport {
    client: AsyncClient,
    link: Arc<Link>,
}

impl MqttTransport {
    /// Create the client and spawn its event loop on the current Tokio
    /// runtime.  The link starts down; the first successful ConnAck emits
    /// [`ConnectionEvent::Connected`].
    ///
    /// The returned task ends once [`Transport::stop`] has sent the
    /// disconnect, so awaiting it after `stop` flushes queued publishes.
    pub fn start(settings: &BrokerSettings) -> (Arc<Self>, JoinHandle<()>) {
        let (transport, event_loop) = Self::new(settings);
        let link = Arc::clone(&transport.link);
        let delay = settings.reconnect_delay;
        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "connecting to broker");
        let handle = tokio::spawn(drive(event_loop, link, delay));
        (Arc::new(transport), handle)
    }

    fn new(settings: &BrokerSettings) -> (Self, EventLoop) {
        let (client, event_loop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
        (
            Self {
                client,
                link: Arc::new(Link::new()),
            },
            event_loop,
        )
    }
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: &str, retained: bool) -> Result<(), BridgeError> {
        if self.link.is_stopped() {
            return Err(BridgeError::Transport("broker link stopped".to_string()));
        }
        if !self.is_connected() {
            return Err(BridgeError::TransportDisconnected);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retained, payload.as_bytes().to_vec())
            .map_err(|e| BridgeError::Transport(format!("publish to {topic}: {e}")))?;
        debug!(topic, payload, retained, "publish queued");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.events.subscribe()
    }

    fn stop(&self) {
        if self.link.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect request not queued");
        }
        info!("broker link stopping");
    }
}

/// Poll the event loop until the link is stopped.  Connection errors mark
/// the link down and are retried after `reconnect_delay`.
async fn drive(mut event_loop: EventLoop, link: Arc<Link>, reconnect_delay: Duration) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    link.up();
                } else {
                    warn!(code = ?ack.code, "broker refused connection");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                link.down();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                link.down();
                if link.is_stopped() {
                    break;
                }
                warn!(error = %e, retry_in_ms = reconnect_delay.as_millis() as u64, "broker connection failed");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    debug!("broker event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local(port: u16) -> BrokerSettings {
        let mut settings = BrokerSettings::parse(&format!("127.0.0.1:{port}"), "magbridge-test").unwrap();
        settings.reconnect_delay = Duration::from_millis(10);
        settings
    }

    #[test]
    fn broker_urls_are_parsed() {
        let s = BrokerSettings::parse("tcp://localhost:1883", "id").unwrap();
        assert_eq!((s.host.as_str(), s.port), ("localhost", 1883));

        let s = BrokerSettings::parse("mqtt://broker.lan:2883/", "id").unwrap();
        assert_eq!((s.host.as_str(), s.port), ("broker.lan", 2883));

        let s = BrokerSettings::parse("wirenboard", "id").unwrap();
        assert_eq!((s.host.as_str(), s.port), ("wirenboard", DEFAULT_PORT));
        assert_eq!(s.client_id, "id");
    }

    #[test]
    fn bad_broker_urls_are_configuration_errors() {
        for url in ["ws://localhost:1883", "tcp://:1883", "localhost:port", "", "host:70000"] {
            assert!(
                matches!(BrokerSettings::parse(url, "id"), Err(BridgeError::Configuration(_))),
                "accepted: {url:?}"
            );
        }
    }

    #[test]
    fn link_events_fire_only_on_change() {
        let link = Link::new();
        let mut rx = link.events.subscribe();

        link.down();
        link.up();
        link.up();
        link.down();
        link.down();

        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Connected);
        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_before_connack_is_refused() {
        let (transport, _event_loop) = MqttTransport::new(&local(DEFAULT_PORT));
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("/devices/t/meta", "{}", true),
            Err(BridgeError::TransportDisconnected)
        ));
    }

    #[tokio::test]
    async fn stopped_transport_refuses_publishes() {
        let (transport, _event_loop) = MqttTransport::new(&local(DEFAULT_PORT));
        transport.link.up();
        transport.stop();
        transport.stop();
        assert!(matches!(
            transport.publish("/devices/t/meta", "{}", true),
            Err(BridgeError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_stays_down_and_stops_cleanly() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (transport, handle) = MqttTransport::start(&local(port));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transport.is_connected());

        transport.stop();
        assert!(tokio::time::timeout(Duration::from_secs(2), handle).await.is_ok());
    }

    #[tokio::test]
    async fn connack_brings_link_up_and_publishes_are_retained() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            assert_eq!(buf[0], 0x10, "expected CONNECT");
            // CONNACK: session not present, accepted.
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut received = Vec::new();
            let topic = b"/devices/t/controls/field";
            while !received.windows(topic.len()).any(|w| w == topic) {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before publishing");
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let (transport, handle) = MqttTransport::start(&local(port));
        let mut events = transport.subscribe_connection();
        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no connection event")
            .unwrap();
        assert_eq!(first, ConnectionEvent::Connected);
        assert!(transport.is_connected());

        transport.publish("/devices/t/controls/field", "12.50", true).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), broker)
            .await
            .expect("publish not seen")
            .unwrap();
        // PUBLISH header: QoS 1 with the retain flag.
        assert_eq!(received[0], 0x33);

        transport.stop();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
