use std::sync::Arc;

use tracing::warn;

use crate::broadcast::{Message, Peers};
use crate::common::{NodeId, TransportError};

/// Point-to-point link layer. Delivery is asynchronous and best effort, to
/// `message.current_receiver`.
pub trait Transport: Send + Sync {
    fn send(&self, message: Message) -> Result<(), TransportError>;
}

/// Sending side of one servent.
pub struct Outbox {
    pub peers: Peers,
    transport: Arc<dyn Transport>,
}

impl Outbox {
    pub fn new(peers: Peers, transport: Arc<dyn Transport>) -> Self {
        Outbox { peers, transport }
    }

    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        let receiver = message.current_receiver;
        self.transport.send(message).inspect_err(|err| {
            warn!(node = self.peers.me, to = receiver, %err, "send failed");
        })
    }

    /// Sends each message to its own receiver. Failures are logged by `send`.
    pub fn send_all(&self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            let _ = self.send(message);
        }
    }

    /// Copy of `message` to every neighbor.
    pub fn broadcast(&self, message: &Message) {
        self.broadcast_except(message, &[]);
    }

    pub fn broadcast_except(&self, message: &Message, skip: &[NodeId]) {
        self.send_all(
            self.peers
                .neighbors
                .iter()
                .filter(|n| !skip.contains(n))
                .map(|neighbor| message.changed_receiver(*neighbor)),
        );
    }
}
