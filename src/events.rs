//! Process-wide event bus
//!
//! Every subscriber sees every event published after it subscribed.

use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The node has been registered with the exchange.
    NodeConfigured {
        org: String,
        device_id: String,
        pattern: String,
    },
    /// The node is being taken out of service.
    NodeUnconfigured,
    PolicyCreated {
        org: String,
        url: String,
        name: String,
    },
    ServiceArchived {
        org: String,
        url: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        trace!(?event, "Publishing event");
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(Event::NodeUnconfigured), 0);

        let mut a = bus.subscribe();
        let mut b = bus.clone().subscribe();
        assert_eq!(bus.publish(Event::NodeUnconfigured), 2);

        assert_eq!(a.recv().await.unwrap(), Event::NodeUnconfigured);
        assert_eq!(b.recv().await.unwrap(), Event::NodeUnconfigured);
    }
}
