//! The pub/sub transport contract.
//!
//! The virtual device never talks to a broker directly.  It publishes through
//! a [`Transport`] and learns about link changes by subscribing to the
//! transport's connection notifications once, at construction.

use magbridge_types::{BridgeError, ConnectionEvent};
use tokio::sync::broadcast;

/// A retained-message pub/sub link.
///
/// # Contract
///
/// * `publish` – deliver `payload` on `topic`.  With `retained = true` the
///   broker keeps the payload for late subscribers; an empty retained
///   payload clears the topic.  Returns
///   [`BridgeError::TransportDisconnected`] while the link is down.
/// * `subscribe_connection` – a receiver of every subsequent
///   [`ConnectionEvent`].
/// * `stop` – shut the link down for good.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, retained: bool) -> Result<(), BridgeError>;

    fn is_connected(&self) -> bool;

    fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn stop(&self);
}
