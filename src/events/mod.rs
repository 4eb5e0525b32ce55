//! Event bus for state and progress notifications
//!
//! The engine and the writer publish here; the shell subscribes to print
//! progress while a write runs.

pub mod types;

pub use types::LabEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus built on a tokio broadcast channel
///
/// Events are delivered to all active subscribers. A subscriber that falls
/// too far behind receives `Lagged` and misses events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LabEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is dropped.
    pub fn publish(&self, event: LabEvent) {
        let _ = self.tx.send(event);
    }

    /// Receiver for all future events
    pub fn subscribe(&self) -> broadcast::Receiver<LabEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(LabEvent::ImageSelected {
            name: "debian.iso".to_string(),
            path: "/srv/debian.iso".to_string(),
            size: 1,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, LabEvent::ImageSelected { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(LabEvent::GadgetStateChanged {
            state: "keyboard".to_string(),
            image: None,
            reason: None,
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            LabEvent::GadgetStateChanged { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            LabEvent::GadgetStateChanged { .. }
        ));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        bus.publish(LabEvent::WriteProgress {
            job_id: "x".to_string(),
            bytes_written: 0,
            total_bytes: 0,
        });
    }
}
