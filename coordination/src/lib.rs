//! DoveText Escalation Engine
//!
//! Drives notification escalation chains for triggered alerts until a human
//! acknowledges, every stage is exhausted, or the instance fails.
//!
//! # Modules
//!
//! - [`chain`]: chain and delivery-method definitions, both admin document
//!   schemas, and the store contracts with an in-memory implementation
//! - [`escalation`]: instance state machine and retry policy (pure, no I/O)
//! - [`timer`]: single-driver deadline scheduler with lazy cancellation
//! - [`dispatch`]: the `Dispatcher` capability and its adapters
//! - [`coordinator`]: per-instance actors, ack priority, archive
//! - [`events`]: lifecycle event bus and in-memory history
//! - [`config`]: `EngineConfig` from `ESCALATION_*` env vars or TOML
//!
//! # Usage
//!
//! ```ignore
//! let store = MemoryStore::load_json("seed.json")?.shared();
//! let coordinator = EscalationCoordinator::start(
//!     store.clone(),
//!     store,
//!     Arc::new(LogDispatcher::new()),
//!     EngineConfig::default(),
//! );
//! let id = coordinator.trigger("ops-critical", json!({"title": "disk full"}))?;
//! coordinator.acknowledge(&id, Some("alice".into())).await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod events;
pub mod timer;

pub use chain::{
    ChainDocument, ChainStore, DeliveryMethod, DeliveryMethodType, EscalationChain,
    EscalationStage, MemoryStore, MethodStore, SharedChainStore, SharedMethodStore,
};
pub use config::EngineConfig;
pub use coordinator::{AckOutcome, EscalationCoordinator, SharedCoordinator};
pub use dispatch::{
    DispatchPayload, DispatchReport, DispatchResult, Dispatcher, LogDispatcher, MethodRouter,
    RecordingDispatcher, SharedDispatcher, WebhookDispatcher,
};
pub use error::{
    ConfigurationError, DispatchError, EngineError, EngineResult, StoreError, TimerError,
};
pub use escalation::{AllFailedPolicy, InstanceStatus, NotificationInstance, RetryDecision};
pub use events::{EscalationEvent, EventBus, EventFilter, EventHistory, EventStats};
pub use timer::{TimerFired, TimerHandle, TimerScheduler};
