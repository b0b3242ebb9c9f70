//! Core event channel
//!
//! Connection and execution state changes are published to all current
//! subscribers over a broadcast channel. Publishing never blocks; subscribers
//! that fall behind miss old events rather than stalling the core.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connection::ConnectionState;

/// Typed lifecycle events published by the core
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A server's connection state changed
    ServerStateChanged {
        server: String,
        state: ConnectionState,
    },
    /// An invocation was accepted and recorded
    ExecutionStarted {
        invocation_id: Uuid,
        tool: String,
        session_id: String,
    },
    /// An invocation finished with a result
    ExecutionCompleted { invocation_id: Uuid, tool: String },
    /// An invocation finished with an error
    ExecutionFailed {
        invocation_id: Uuid,
        tool: String,
        error: String,
    },
    /// An invocation was cancelled (explicitly or by timeout)
    ExecutionCancelled { invocation_id: Uuid, tool: String },
}

/// Broadcast bus for [`CoreEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; no-op when there are no subscribers
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
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
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(CoreEvent::ServerStateChanged {
            server: "weather".to_string(),
            state: ConnectionState::Connecting,
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            CoreEvent::ServerStateChanged { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            CoreEvent::ServerStateChanged { .. }
        ));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(CoreEvent::ExecutionCompleted {
            invocation_id: Uuid::new_v4(),
            tool: "echo".to_string(),
        });
    }
}
