//! Event types for escalation execution
//!
//! Every lifecycle step of a notification instance is published as one of
//! these events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainId, MethodId};
use crate::escalation::{InstanceId, InstanceStatus};

/// All escalation lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationEvent {
    /// An alert was triggered against a chain
    InstanceCreated {
        instance_id: InstanceId,
        chain_id: ChainId,
        timestamp: DateTime<Utc>,
    },

    /// The instance moved into a stage
    StageEntered {
        instance_id: InstanceId,
        chain_id: ChainId,
        stage_order: u32,
        timestamp: DateTime<Utc>,
    },

    /// A send was handed to the dispatcher
    DispatchIssued {
        instance_id: InstanceId,
        chain_id: ChainId,
        method_id: MethodId,
        stage_order: u32,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A dispatcher reported back
    DispatchCompleted {
        instance_id: InstanceId,
        method_id: MethodId,
        stage_order: u32,
        attempt: u32,
        success: bool,
        error: Option<String>,
        /// Reported after the instance had already finished
        late: bool,
        timestamp: DateTime<Utc>,
    },

    /// Every method of an attempt failed
    AllDispatchesFailed {
        instance_id: InstanceId,
        stage_order: u32,
        attempt: u32,
        short_circuit: bool,
        timestamp: DateTime<Utc>,
    },

    /// The instance's wait or retry timer was armed
    TimerArmed {
        instance_id: InstanceId,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A lost timer was re-armed by the watchdog
    TimerRearmed {
        instance_id: InstanceId,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    InstanceAcknowledged {
        instance_id: InstanceId,
        chain_id: ChainId,
        acknowledged_by: Option<String>,
        timestamp: DateTime<Utc>,
    },

    InstanceExhausted {
        instance_id: InstanceId,
        chain_id: ChainId,
        timestamp: DateTime<Utc>,
    },

    InstanceFailed {
        instance_id: InstanceId,
        chain_id: ChainId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl EscalationEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::InstanceCreated { timestamp, .. }
            | Self::StageEntered { timestamp, .. }
            | Self::DispatchIssued { timestamp, .. }
            | Self::DispatchCompleted { timestamp, .. }
            | Self::AllDispatchesFailed { timestamp, .. }
            | Self::TimerArmed { timestamp, .. }
            | Self::TimerRearmed { timestamp, .. }
            | Self::InstanceAcknowledged { timestamp, .. }
            | Self::InstanceExhausted { timestamp, .. }
            | Self::InstanceFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InstanceCreated { .. } => "instance_created",
            Self::StageEntered { .. } => "stage_entered",
            Self::DispatchIssued { .. } => "dispatch_issued",
            Self::DispatchCompleted { .. } => "dispatch_completed",
            Self::AllDispatchesFailed { .. } => "all_dispatches_failed",
            Self::TimerArmed { .. } => "timer_armed",
            Self::TimerRearmed { .. } => "timer_rearmed",
            Self::InstanceAcknowledged { .. } => "instance_acknowledged",
            Self::InstanceExhausted { .. } => "instance_exhausted",
            Self::InstanceFailed { .. } => "instance_failed",
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            Self::InstanceCreated { instance_id, .. }
            | Self::StageEntered { instance_id, .. }
            | Self::DispatchIssued { instance_id, .. }
            | Self::DispatchCompleted { instance_id, .. }
            | Self::AllDispatchesFailed { instance_id, .. }
            | Self::TimerArmed { instance_id, .. }
            | Self::TimerRearmed { instance_id, .. }
            | Self::InstanceAcknowledged { instance_id, .. }
            | Self::InstanceExhausted { instance_id, .. }
            | Self::InstanceFailed { instance_id, .. } => instance_id,
        }
    }

    /// Get the chain ID if the event carries one
    pub fn chain_id(&self) -> Option<&str> {
        match self {
            Self::InstanceCreated { chain_id, .. }
            | Self::StageEntered { chain_id, .. }
            | Self::DispatchIssued { chain_id, .. }
            | Self::InstanceAcknowledged { chain_id, .. }
            | Self::InstanceExhausted { chain_id, .. }
            | Self::InstanceFailed { chain_id, .. } => Some(chain_id),
            _ => None,
        }
    }

    /// Terminal status this event announces, if any
    pub fn terminal_status(&self) -> Option<InstanceStatus> {
        match self {
            Self::InstanceAcknowledged { .. } => Some(InstanceStatus::Acknowledged),
            Self::InstanceExhausted { .. } => Some(InstanceStatus::Exhausted),
            Self::InstanceFailed { .. } => Some(InstanceStatus::Failed),
            _ => None,
        }
    }
}
