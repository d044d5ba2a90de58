//! Outward user-event bus
//!
//! Events are published here only after they are durably recorded in the
//! events table, so a subscriber never observes an event that could
//! disappear on crash. Slow subscribers lag rather than block the
//! pipeline; they can re-read missed events from the store by sequence.

use pinloom_model::UserEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UserEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn publish(&self, event: UserEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinloom_model::UserEventType;
    use uuid::Uuid;

    fn sample_event() -> UserEvent {
        UserEvent {
            id: Uuid::new_v4(),
            event_type: UserEventType::MessageConfirmed,
            namespace: "ns1".into(),
            reference: Uuid::new_v4(),
            topic: Some("topic1".into()),
            sequence: 1,
            created: 1000,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(sample_event());
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let event = sample_event();
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
