//! Escalation: per-instance state machine and retry policy
//!
//! ```text
//! Pending ──▶ Dispatching ──▶ WaitingAck ──timer──▶ policy::evaluate
//!                 ▲                │                  │
//!                 │                │ ack              ├─ Retry   ─▶ Dispatching (same stage)
//!                 │                ▼                  ├─ Advance ─▶ Escalating ─▶ Dispatching
//!                 │          Acknowledged             └─ Exhaust ─▶ Exhausted
//!                 └────────────────────────────────────────────────┘
//! ```
//!
//! Everything in this module is synchronous and free of I/O. The
//! coordinator's per-instance actors feed it inputs and execute the
//! resulting effects.

pub mod machine;
pub mod policy;
pub mod state;

pub use machine::{DispatchOrder, DispatchOutcome, Effect, InstanceMachine};
pub use policy::{evaluate, AllFailedPolicy, RetryDecision};
pub use state::{
    is_legal_transition, DispatchRecord, IllegalTransition, InstanceId, InstanceStatus,
    NotificationInstance, TransitionRecord,
};
