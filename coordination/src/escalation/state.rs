//! Notification instance state: status graph and audit records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainId, MethodId};

/// Identifier of a live or archived notification instance
pub type InstanceId = String;

/// Lifecycle of one triggered alert.
///
/// Every instance starts at `Pending` and ends at `Acknowledged`,
/// `Exhausted` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    /// Issuing the current attempt's fan-out
    Dispatching,
    /// Fan-out issued; a wait or retry timer is armed
    WaitingAck,
    /// Moving to the next stage
    Escalating,
    Acknowledged,
    Exhausted,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Exhausted | Self::Failed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Dispatching => write!(f, "Dispatching"),
            Self::WaitingAck => write!(f, "WaitingAck"),
            Self::Escalating => write!(f, "Escalating"),
            Self::Acknowledged => write!(f, "Acknowledged"),
            Self::Exhausted => write!(f, "Exhausted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal edges of the status graph:
/// ```text
/// Pending     → Dispatching | Exhausted (inert chain)
/// Dispatching → WaitingAck
/// WaitingAck  → Dispatching (retry) | Escalating | Exhausted
/// Escalating  → Dispatching
/// any non-terminal → Acknowledged | Failed
/// ```
pub fn is_legal_transition(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::*;

    if from.is_terminal() {
        return false;
    }
    if matches!(to, Acknowledged | Failed) {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Dispatching)
            | (Pending, Exhausted)
            | (Dispatching, WaitingAck)
            | (WaitingAck, Dispatching)
            | (WaitingAck, Escalating)
            | (WaitingAck, Exhausted)
            | (Escalating, Dispatching)
    )
}

/// Error returned when an illegal transition is attempted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal status transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// A single recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub stage_index: usize,
    pub attempt_in_stage: u32,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Audit entry for one dispatch outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub method_id: MethodId,
    pub stage_index: usize,
    pub attempt: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// Arrived after the instance reached a terminal status
    #[serde(default)]
    pub late: bool,
}

/// Runtime state of one escalation, never persisted by the chain layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationInstance {
    pub id: InstanceId,
    pub chain_id: ChainId,
    pub current_stage_index: usize,
    pub attempt_in_stage: u32,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    pub payload: serde_json::Value,
    pub transitions: Vec<TransitionRecord>,
    pub dispatches: Vec<DispatchRecord>,
}

impl NotificationInstance {
    pub fn new(chain_id: impl Into<ChainId>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chain_id: chain_id.into(),
            current_stage_index: 0,
            attempt_in_stage: 0,
            status: InstanceStatus::Pending,
            created_at: now,
            last_transition_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            terminal_reason: None,
            payload,
            transitions: Vec::new(),
            dispatches: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change if the graph allows it
    pub fn transition(
        &mut self,
        to: InstanceStatus,
        reason: Option<String>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.status, to) {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.transitions.push(TransitionRecord {
            from: self.status,
            to,
            stage_index: self.current_stage_index,
            attempt_in_stage: self.attempt_in_stage,
            at: now,
            reason,
        });
        self.status = to;
        self.last_transition_at = now;
        Ok(())
    }

    /// Sequence of statuses visited, starting from `Pending`
    pub fn status_path(&self) -> Vec<InstanceStatus> {
        let mut path = vec![InstanceStatus::Pending];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }

    pub fn summary(&self) -> String {
        format!(
            "instance={} chain={} status={} stage={} attempt={} dispatches={}",
            self.id,
            self.chain_id,
            self.status,
            self.current_stage_index,
            self.attempt_in_stage,
            self.dispatches.len(),
        )
    }
}
