//! Escalation event stream
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): one variant per lifecycle step of a
//!    notification instance.
//!
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast pub/sub with filtered
//!    subscriptions.
//!
//! 3. **Event History** (`history.rs`): bounded in-memory ring fed by a
//!    recorder task, with per-instance and per-chain queries and statistics.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Instance   │────▶│  Event Bus   │────▶│  Subscribers │
//! │    actors    │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │ EventHistory │
//!                      │    (ring)    │
//!                      └──────────────┘
//! ```

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{
    EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter, FilteredReceiver,
    SharedEventBus,
};
pub use history::{spawn_recorder, EventHistory, EventStats, SharedEventHistory};
pub use types::EscalationEvent;
