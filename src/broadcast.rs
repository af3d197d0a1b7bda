use serde::Serialize;
use tokio::sync::broadcast;

/// Event name for the per-round update.
pub const UPDATE_SERVERS: &str = "updateServers";

/// One message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Fan-out of named events to connected clients.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, event: &str, payload: serde_json::Value);
}

/// Broadcaster backed by a `tokio::sync::broadcast` channel.
///
/// Sending with no subscribers is not an error; slow subscribers lag and
/// lose the oldest messages.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Message>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: &str, payload: serde_json::Value) {
        let message = Message {
            event: event.to_string(),
            payload,
        };

        if self.tx.send(message).is_err() {
            tracing::trace!(event, "no subscribers");
        }
    }
}
