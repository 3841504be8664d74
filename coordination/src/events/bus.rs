//! Event bus for escalation events
//!
//! Pub/sub over a Tokio broadcast channel. Publishing never blocks and
//! never fails because nobody is listening.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::EscalationEvent;

/// Default channel capacity for broadcast
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Subscriber lagged, {0} events skipped")]
    Lagged(u64),

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<broadcast::error::RecvError> for EventBusError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
            broadcast::error::RecvError::Closed => Self::ChannelClosed,
        }
    }
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast event bus
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EscalationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers; returns how many received it
    pub fn publish(&self, event: EscalationEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
                count
            }
            Err(_) => {
                debug!(event_type, "Event published (no receivers)");
                0
            }
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<EscalationEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub instance_id: Option<String>,
    pub chain_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    /// Events without a chain id pass a chain filter
    pub fn chain(mut self, chain_id: &str) -> Self {
        self.chain_id = Some(chain_id.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &EscalationEvent) -> bool {
        if let Some(ref iid) = self.instance_id {
            if event.instance_id() != iid {
                return false;
            }
        }

        if let Some(ref cid) = self.chain_id {
            if let Some(event_cid) = event.chain_id() {
                if event_cid != cid {
                    return false;
                }
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<EscalationEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<EscalationEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> EventBusResult<EscalationEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn created(instance_id: &str, chain_id: &str) -> EscalationEvent {
        EscalationEvent::InstanceCreated {
            instance_id: instance_id.to_string(),
            chain_id: chain_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        assert_eq!(bus.publish(created("i-1", "ops")), 1);

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "instance_created");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::with_capacity(4);
        assert!(!bus.has_subscribers());
        assert_eq!(bus.publish(created("i-1", "ops")), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(created("i-1", "ops"));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1, e2);
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .chain("ops")
            .types(vec!["instance_created", "timer_armed"]);

        let timer = EscalationEvent::TimerArmed {
            instance_id: "i-9".to_string(),
            delay_ms: 10,
            timestamp: Utc::now(),
        };

        assert!(filter.matches(&created("i-1", "ops")));
        assert!(!filter.matches(&created("i-1", "billing")));
        // no chain id on the event, type matches
        assert!(filter.matches(&timer));
        assert!(!EventFilter::new().instance("i-1").matches(&timer));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new().shared();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().instance("target"));

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(created("other", "ops"));
            publisher.publish(created("target", "ops"));
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.instance_id(), "target");
    }
}
