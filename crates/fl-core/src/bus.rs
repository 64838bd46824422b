use std::sync::{Arc, Mutex};

use crate::types::FeedbackMessage;

/// A broadcast-style message bus built on top of flume channels.
///
/// Every persisted [`FeedbackMessage`] is published here so in-process
/// waiters (escalating workers, the CLI tail) observe queue activity without
/// polling the store. Each call to [`subscribe`](MessageBus::subscribe)
/// creates a receiver that sees every message published after it was created.
/// The bus is cheap to clone.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<Vec<flume::Sender<FeedbackMessage>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<FeedbackMessage> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.push(tx);
        rx
    }

    /// Publish a message to all current subscribers.
    ///
    /// Subscribers whose receivers have been dropped are pruned.
    pub fn publish(&self, msg: FeedbackMessage) {
        let mut senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus = MessageBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(FeedbackMessage::new("w1", None, MessageType::Notification, "hi"));

        assert_eq!(a.try_recv().unwrap().content, "hi");
        assert_eq!(b.try_recv().unwrap().content, "hi");
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = MessageBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(FeedbackMessage::new("w1", None, MessageType::Notification, "x"));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
