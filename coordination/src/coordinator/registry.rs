//! Live instance registry and terminal archive
//!
//! Live entries hold the sending halves of each actor's queues. Sends happen
//! under the map's read lock and retirement takes the write lock, so once an
//! actor has retired nothing new can reach its queues. Retired instances move
//! into a bounded archive, which is inserted before the live entry is
//! removed so a lookup never misses both.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::dispatch::DispatchReport;
use crate::escalation::{DispatchRecord, InstanceId, InstanceStatus, NotificationInstance};
use crate::timer::TimerFired;

/// Outcome of an acknowledgment request
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// This request stopped the escalation
    Accepted,
    /// The instance had already been acknowledged
    AlreadyAcknowledged,
}

/// Actor reply: accepted, or the terminal status it already had
pub(crate) type AckReply = Result<AckOutcome, InstanceStatus>;

pub(crate) struct AckRequest {
    pub acknowledged_by: Option<String>,
    pub reply: oneshot::Sender<AckReply>,
}

/// Non-ack input to an instance actor
pub(crate) enum InstanceInput {
    Timer(TimerFired),
    DispatchResult(DispatchReport),
    /// Re-arm the wait timer if it was lost; replies whether it re-armed
    Rearm(oneshot::Sender<bool>),
}

pub(crate) struct LiveEntry {
    pub acks: mpsc::UnboundedSender<AckRequest>,
    pub inputs: mpsc::UnboundedSender<InstanceInput>,
    pub snapshot: watch::Receiver<NotificationInstance>,
}

#[derive(Default)]
struct Archive {
    order: VecDeque<InstanceId>,
    instances: HashMap<InstanceId, NotificationInstance>,
}

pub(crate) struct InstanceRegistry {
    live: RwLock<HashMap<InstanceId, LiveEntry>>,
    archive: Mutex<Archive>,
    archive_capacity: usize,
}

impl InstanceRegistry {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            archive: Mutex::new(Archive::default()),
            archive_capacity: archive_capacity.max(1),
        }
    }

    pub fn insert(&self, id: InstanceId, entry: LiveEntry) {
        if let Ok(mut live) = self.live.write() {
            live.insert(id, entry);
        }
    }

    /// Hand an input to a live actor. Gives it back if the instance is not live.
    pub fn send_input(&self, id: &str, input: InstanceInput) -> Result<(), InstanceInput> {
        let Ok(live) = self.live.read() else {
            return Err(input);
        };
        match live.get(id) {
            Some(entry) => entry.inputs.send(input).map_err(|e| e.0),
            None => Err(input),
        }
    }

    pub fn send_ack(&self, id: &str, request: AckRequest) -> Result<(), AckRequest> {
        let Ok(live) = self.live.read() else {
            return Err(request);
        };
        match live.get(id) {
            Some(entry) => entry.acks.send(request).map_err(|e| e.0),
            None => Err(request),
        }
    }

    /// Broadcast an input to every live actor, built per instance
    pub fn send_all<F>(&self, mut make: F) -> usize
    where
        F: FnMut() -> InstanceInput,
    {
        let Ok(live) = self.live.read() else {
            return 0;
        };
        live.values()
            .filter(|entry| entry.inputs.send(make()).is_ok())
            .count()
    }

    pub fn watch_live(&self, id: &str) -> Option<watch::Receiver<NotificationInstance>> {
        let live = self.live.read().ok()?;
        live.get(id).map(|entry| entry.snapshot.clone())
    }

    pub fn live_snapshots(&self) -> Vec<NotificationInstance> {
        let Ok(live) = self.live.read() else {
            return Vec::new();
        };
        let mut snapshots: Vec<_> = live
            .values()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub fn live_count(&self) -> usize {
        self.live.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Move a finished instance from the live map into the archive
    pub fn retire(&self, instance: NotificationInstance) {
        let Ok(mut live) = self.live.write() else {
            return;
        };
        let id = instance.id.clone();
        if let Ok(mut archive) = self.archive.lock() {
            if archive.instances.insert(id.clone(), instance).is_none() {
                archive.order.push_back(id.clone());
            }
            while archive.order.len() > self.archive_capacity {
                if let Some(evicted) = archive.order.pop_front() {
                    archive.instances.remove(&evicted);
                }
            }
        }
        live.remove(&id);
    }

    pub fn archived(&self, id: &str) -> Option<NotificationInstance> {
        self.archive.lock().ok()?.instances.get(id).cloned()
    }

    pub fn archived_snapshots(&self) -> Vec<NotificationInstance> {
        let Ok(archive) = self.archive.lock() else {
            return Vec::new();
        };
        archive
            .order
            .iter()
            .filter_map(|id| archive.instances.get(id).cloned())
            .collect()
    }

    /// Append a late dispatch result to an archived instance.
    /// Returns `false` if the instance is not archived.
    pub fn record_late(
        &self,
        id: &str,
        stage_index: usize,
        attempt: u32,
        report: &DispatchReport,
    ) -> bool {
        let Ok(mut archive) = self.archive.lock() else {
            return false;
        };
        let Some(instance) = archive.instances.get_mut(id) else {
            return false;
        };
        instance.dispatches.push(DispatchRecord {
            method_id: report.method_id.clone(),
            stage_index,
            attempt,
            success: report.result.success,
            error: report.result.error.clone(),
            delivery_id: report.result.delivery_id.clone(),
            recorded_at: Utc::now(),
            late: true,
        });
        true
    }

    /// Stage index and attempt an archived instance ended on
    pub fn archived_position(&self, id: &str) -> Option<(usize, u32)> {
        let archive = self.archive.lock().ok()?;
        archive
            .instances
            .get(id)
            .map(|i| (i.current_stage_index, i.attempt_in_stage))
    }
}
