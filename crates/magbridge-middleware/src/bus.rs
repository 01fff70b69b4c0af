//! In-process retained-message broker.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every publication without any single subscriber
//! blocking the others.  On top of the fan-out it keeps the last retained
//! payload per topic, the way an MQTT broker does, and can simulate link
//! loss and broker restarts.
//!
//! # Channels
//!
//! | Channel | Traffic |
//! |---|---|
//! | publications | every [`Publication`], retained or not |
//! | connection | [`ConnectionEvent::Connected`] / [`ConnectionEvent::Disconnected`] |

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use magbridge_types::{BridgeError, ConnectionEvent, Publication};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::transport::Transport;

/// Default channel capacity (number of buffered publications before old ones
/// are dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

struct Inner {
    retained: RwLock<BTreeMap<String, Publication>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    publications: broadcast::Sender<Publication>,
    connection: broadcast::Sender<ConnectionEvent>,
}

/// Shared broker handle.  Clone it cheaply – all clones share the same
/// retained store and broadcast channels.
///
/// A new bus starts connected.
#[derive(Clone)]
pub struct RetainedBus {
    inner: Arc<Inner>,
}

impl RetainedBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (publications, _) = broadcast::channel(capacity);
        let (connection, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                retained: RwLock::new(BTreeMap::new()),
                connected: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                publications,
                connection,
            }),
        }
    }

    /// The payload currently retained on `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.read_retained().get(topic).map(|p| p.payload.clone())
    }

    /// Every retained publication, ordered by topic.
    pub fn retained_snapshot(&self) -> Vec<Publication> {
        self.read_retained().values().cloned().collect()
    }

    /// Subscribe to every publication from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.inner.publications.subscribe()
    }

    /// Bring the link up.  Emits [`ConnectionEvent::Connected`] only when it
    /// was down.
    pub fn connect(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            info!("bus link up");
            let _ = self.inner.connection.send(ConnectionEvent::Connected);
        }
    }

    /// Drop the link.  Emits [`ConnectionEvent::Disconnected`] only when it
    /// was up.
    pub fn disconnect(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            info!("bus link down");
            let _ = self.inner.connection.send(ConnectionEvent::Disconnected);
        }
    }

    /// Simulate a broker restart: the link drops, all retained state is lost,
    /// and the link comes back.
    pub fn restart(&self) {
        self.disconnect();
        self.write_retained().clear();
        self.connect();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn read_retained(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Publication>> {
        self.inner
            .retained
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_retained(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Publication>> {
        self.inner
            .retained
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RetainedBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Transport for RetainedBus {
    /// Returns `Ok(())` when nobody is subscribed; that is a normal
    /// condition for a broker.
    fn publish(&self, topic: &str, payload: &str, retained: bool) -> Result<(), BridgeError> {
        if self.is_stopped() {
            return Err(BridgeError::Transport("bus stopped".to_string()));
        }
        if !self.is_connected() {
            return Err(BridgeError::TransportDisconnected);
        }

        let publication = Publication {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retained,
            timestamp: Utc::now(),
        };
        if retained {
            let mut store = self.write_retained();
            if payload.is_empty() {
                store.remove(topic);
            } else {
                store.insert(topic.to_string(), publication.clone());
            }
        }
        debug!(topic, payload, retained, "publish");
        let _ = self.inner.publications.send(publication);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe()
    }

    fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.disconnect();
            info!("bus stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = RetainedBus::default();
        let mut rx = bus.subscribe();

        bus.publish("/devices/x/meta", "{}", true)?;

        let received = rx.recv().await?;
        assert_eq!(received.topic, "/devices/x/meta");
        assert_eq!(received.payload, "{}");
        assert!(received.retained);
        Ok(())
    }

    #[test]
    fn publish_with_no_subscribers_is_ok() {
        let bus = RetainedBus::default();
        assert!(bus.publish("a", "1", false).is_ok());
    }

    #[test]
    fn retained_payload_is_kept_and_replaced() {
        let bus = RetainedBus::default();
        bus.publish("a", "1", true).unwrap();
        bus.publish("a", "2", true).unwrap();
        bus.publish("b", "x", false).unwrap();

        assert_eq!(bus.retained("a").as_deref(), Some("2"));
        assert_eq!(bus.retained("b"), None);
    }

    #[test]
    fn empty_retained_payload_clears_topic() {
        let bus = RetainedBus::default();
        bus.publish("a", "1", true).unwrap();
        bus.publish("a", "", true).unwrap();
        assert_eq!(bus.retained("a"), None);
        assert!(bus.retained_snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_topic() {
        let bus = RetainedBus::default();
        bus.publish("b", "2", true).unwrap();
        bus.publish("a", "1", true).unwrap();
        let topics: Vec<_> = bus.retained_snapshot().into_iter().map(|p| p.topic).collect();
        assert_eq!(topics, vec!["a", "b"]);
    }

    #[test]
    fn publish_while_disconnected_is_refused() {
        let bus = RetainedBus::default();
        bus.disconnect();
        assert_eq!(
            bus.publish("a", "1", true),
            Err(BridgeError::TransportDisconnected)
        );
        assert_eq!(bus.retained("a"), None);
    }

    #[tokio::test]
    async fn connection_events_fire_only_on_change() {
        let bus = RetainedBus::default();
        let mut rx = bus.subscribe_connection();

        bus.connect(); // already up: no event
        bus.disconnect();
        bus.disconnect(); // already down: no event
        bus.connect();

        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Disconnected);
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_loses_retained_state_and_reconnects() {
        let bus = RetainedBus::default();
        let mut rx = bus.subscribe_connection();
        bus.publish("a", "1", true).unwrap();

        bus.restart();

        assert_eq!(bus.retained("a"), None);
        assert!(bus.is_connected());
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Disconnected);
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Connected);
    }

    #[test]
    fn stopped_bus_refuses_everything() {
        let bus = RetainedBus::default();
        bus.stop();
        bus.connect();
        assert!(!bus.is_connected());
        assert!(matches!(
            bus.publish("a", "1", true),
            Err(BridgeError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = RetainedBus::new(16);
        let mut slow = bus.subscribe();
        for i in 0..1_000 {
            bus.publish("flood", &i.to_string(), false).unwrap();
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
