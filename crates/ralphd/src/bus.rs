//! Typed publish/subscribe for loop events.

use ralph_core::LoopEvent;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Fan-out of [`LoopEvent`]s to every connected observer.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LoopEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: LoopEvent) -> usize {
        let kind = event.kind();
        let task_id = event.task_id().to_string();
        match self.tx.send(event) {
            Ok(n) => {
                debug!(kind = kind.as_str(), task_id = %task_id, receivers = n, "published event");
                n
            }
            // No receivers: nothing is watching right now.
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }

    /// Subscription that yields events for one task, or all of them when
    /// `task_id` is `None`. Lag is logged and skipped.
    pub fn subscribe_filtered(&self, task_id: Option<String>) -> EventSubscription {
        EventSubscription {
            task_id,
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug)]
pub struct EventSubscription {
    task_id: Option<String>,
    rx: broadcast::Receiver<LoopEvent>,
}

impl EventSubscription {
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    fn admits(&self, event: &LoopEvent) -> bool {
        self.task_id
            .as_deref()
            .is_none_or(|task_id| event.task_id() == task_id)
    }

    /// Next matching event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<LoopEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.admits(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(task_id = ?self.task_id, skipped = n, "subscriber lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_core::EventKind;

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        assert_eq!(bus.observer_count(), 0);
        assert_eq!(bus.publish(LoopEvent::removed("t1")), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.observer_count(), 2);

        assert_eq!(bus.publish(LoopEvent::removed("t1")), 2);
        assert_eq!(a.recv().await.unwrap().kind(), EventKind::LoopRemoved);
        assert_eq!(b.recv().await.unwrap().task_id(), "t1");

        drop(a);
        assert_eq!(bus.observer_count(), 1);
    }

    #[tokio::test]
    async fn task_subscription_filters() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe_filtered(Some("t2".to_string()));
        assert_eq!(sub.task_id(), Some("t2"));
        bus.publish(LoopEvent::removed("t1"));
        bus.publish(LoopEvent::removed("t2"));
        assert_eq!(sub.recv().await.unwrap().task_id(), "t2");
    }

    #[tokio::test]
    async fn unfiltered_subscription_sees_every_task() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe_filtered(None);
        bus.publish(LoopEvent::removed("t1"));
        bus.publish(LoopEvent::removed("t2"));
        assert_eq!(sub.recv().await.unwrap().task_id(), "t1");
        assert_eq!(sub.recv().await.unwrap().task_id(), "t2");
    }

    #[tokio::test]
    async fn task_subscription_ends_when_bus_drops() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe_filtered(Some("t1".to_string()));
        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_going() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe_filtered(Some("t1".to_string()));
        for _ in 0..5 {
            bus.publish(LoopEvent::removed("t1"));
        }
        assert!(sub.recv().await.is_some());
    }
}
