//! Event history
//!
//! Bounded in-memory ring of published events, fed by a recorder task
//! subscribed to the bus. Oldest events are evicted first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bus::SharedEventBus;
use super::types::EscalationEvent;

/// Shared reference to EventHistory
pub type SharedEventHistory = Arc<EventHistory>;

/// Bounded event history for querying
#[derive(Debug)]
pub struct EventHistory {
    events: Mutex<VecDeque<EscalationEvent>>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn shared(self) -> SharedEventHistory {
        Arc::new(self)
    }

    pub fn record(&self, event: EscalationEvent) {
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything retained, oldest first
    pub fn all(&self) -> Vec<EscalationEvent> {
        self.select(|_| true)
    }

    /// The last `n` events, oldest first
    pub fn recent(&self, n: usize) -> Vec<EscalationEvent> {
        let Ok(events) = self.events.lock() else {
            return Vec::new();
        };
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn get_instance_events(&self, instance_id: &str) -> Vec<EscalationEvent> {
        self.select(|e| e.instance_id() == instance_id)
    }

    pub fn get_chain_events(&self, chain_id: &str) -> Vec<EscalationEvent> {
        self.select(|e| e.chain_id() == Some(chain_id))
    }

    pub fn get_stats(&self) -> EventStats {
        EventStats::from_events(&self.all())
    }

    fn select(&self, pred: impl Fn(&EscalationEvent) -> bool) -> Vec<EscalationEvent> {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| pred(e)).cloned().collect())
            .unwrap_or_default()
    }
}

/// Subscribe `history` to `bus` until `shutdown` fires
pub fn spawn_recorder(
    bus: SharedEventBus,
    history: SharedEventHistory,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => history.record(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event history recorder lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Event history recorder stopped");
    })
}

/// Aggregate statistics for events
#[derive(Debug, Default, serde::Serialize)]
pub struct EventStats {
    pub total_events: usize,
    pub events_by_type: HashMap<String, usize>,
    pub unique_instances: usize,
    pub unique_chains: usize,
    pub dispatches_issued: usize,
    pub dispatch_failures: usize,
    pub late_results: usize,
    pub acknowledged: usize,
    pub exhausted: usize,
    pub failed: usize,
}

impl EventStats {
    pub fn from_events(events: &[EscalationEvent]) -> Self {
        let mut stats = Self::default();
        let mut instances = HashSet::new();
        let mut chains = HashSet::new();

        for event in events {
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;

            instances.insert(event.instance_id().to_string());
            if let Some(cid) = event.chain_id() {
                chains.insert(cid.to_string());
            }

            match event {
                EscalationEvent::DispatchIssued { .. } => stats.dispatches_issued += 1,
                EscalationEvent::DispatchCompleted { success, late, .. } => {
                    if !success {
                        stats.dispatch_failures += 1;
                    }
                    if *late {
                        stats.late_results += 1;
                    }
                }
                EscalationEvent::InstanceAcknowledged { .. } => stats.acknowledged += 1,
                EscalationEvent::InstanceExhausted { .. } => stats.exhausted += 1,
                EscalationEvent::InstanceFailed { .. } => stats.failed += 1,
                _ => {}
            }
        }

        stats.unique_instances = instances.len();
        stats.unique_chains = chains.len();
        stats
    }
}
