//! Engine error types
//!
//! Errors are grouped by the layer that raises them. Configuration problems
//! are returned synchronously to the caller of `trigger`; dispatch problems
//! are folded into failed [`DispatchResult`](crate::dispatch::DispatchResult)s
//! and never abort an escalation; timer faults force the affected instance
//! to `Failed`.

use std::time::Duration;

use thiserror::Error;

use crate::chain::DeliveryMethodType;
use crate::escalation::InstanceStatus;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// A chain, stage or method definition is missing, disabled or malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Escalation chain not found: {chain_id}")]
    ChainNotFound { chain_id: String },

    #[error("Escalation chain is disabled: {chain_id}")]
    ChainDisabled { chain_id: String },

    #[error("Chain {chain_id} defines both `steps` and `stages`")]
    AmbiguousSchema { chain_id: String },

    #[error("Chain {chain_id}, stage {stage_order}: {reason}")]
    InvalidStage {
        chain_id: String,
        stage_order: u32,
        reason: String,
    },

    #[error("Chain {chain_id} stage order is not a dense 1..N sequence: expected {expected}, found {found}")]
    StageOrderGap {
        chain_id: String,
        expected: u32,
        found: u32,
    },

    #[error("Chain {chain_id} has duplicate stage order {stage_order}")]
    DuplicateStageOrder { chain_id: String, stage_order: u32 },

    #[error("Invalid chain {chain_id}: {reason}")]
    InvalidChain { chain_id: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_stage(
        chain_id: impl Into<String>,
        stage_order: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidStage {
            chain_id: chain_id.into(),
            stage_order,
            reason: reason.into(),
        }
    }

    pub fn invalid_chain(chain_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidChain {
            chain_id: chain_id.into(),
            reason: reason.into(),
        }
    }

    /// Machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChainNotFound { .. } => "CHAIN_NOT_FOUND",
            Self::ChainDisabled { .. } => "CHAIN_DISABLED",
            Self::AmbiguousSchema { .. } => "AMBIGUOUS_SCHEMA",
            Self::InvalidStage { .. } => "INVALID_STAGE",
            Self::StageOrderGap { .. } => "STAGE_ORDER_GAP",
            Self::DuplicateStageOrder { .. } => "DUPLICATE_STAGE_ORDER",
            Self::InvalidChain { .. } => "INVALID_CHAIN",
        }
    }
}

/// A single delivery attempt through one method failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Delivery method not found: {method_id}")]
    MethodNotFound { method_id: String },

    #[error("Delivery method is disabled: {method_id}")]
    MethodDisabled { method_id: String },

    #[error("No dispatcher registered for {method_type} methods")]
    NoAdapter { method_type: DeliveryMethodType },

    #[error("Method {method_id} has invalid config: {reason}")]
    InvalidMethodConfig { method_id: String, reason: String },

    #[error("Delivery method lookup failed: {0}")]
    Lookup(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Dispatch timed out after {0:?}")]
    Timeout(Duration),
}

/// The timer scheduler could not service a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer queue lock poisoned")]
    LockPoisoned,

    #[error("Timer scheduler is stopped")]
    SchedulerStopped,

    #[error("Timer delay of {0:?} is out of range")]
    DelayOutOfRange(Duration),
}

/// Errors raised by the chain and method stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Invalid(#[from] ConfigurationError),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Invalid(inner) => inner.code(),
            Self::LockPoisoned => "STORE_UNAVAILABLE",
            Self::Io(_) => "STORE_IO",
            Self::Json(_) => "INVALID_JSON",
        }
    }
}

/// Errors surfaced by the escalation coordinator
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error("Notification instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Notification instance {instance_id} already finished as {status}")]
    InstanceTerminated {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("Escalation coordinator is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn instance_not_found(instance_id: impl Into<String>) -> Self {
        Self::InstanceNotFound(instance_id.into())
    }

    /// Machine-readable code, stable across releases
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(inner) => inner.code(),
            Self::Store(inner) => inner.code(),
            Self::Timer(_) => "TIMER_FAULT",
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::InstanceTerminated { .. } => "INSTANCE_TERMINATED",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Whether the caller sent something wrong (as opposed to an engine fault)
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::InstanceNotFound(_) | Self::InstanceTerminated { .. } => {
                true
            }
            Self::Store(inner) => matches!(
                inner,
                StoreError::NotFound(_) | StoreError::AlreadyExists(_) | StoreError::Invalid(_)
            ),
            Self::Timer(_) | Self::ShuttingDown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err: EngineError = ConfigurationError::ChainDisabled {
            chain_id: "c1".into(),
        }
        .into();
        assert_eq!(err.code(), "CHAIN_DISABLED");
        assert!(err.is_client_error());

        let err: EngineError = TimerError::SchedulerStopped.into();
        assert_eq!(err.code(), "TIMER_FAULT");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_store_invalid_keeps_configuration_code() {
        let err = StoreError::from(ConfigurationError::DuplicateStageOrder {
            chain_id: "c1".into(),
            stage_order: 2,
        });
        assert_eq!(err.code(), "DUPLICATE_STAGE_ORDER");
        assert!(err.to_string().contains("duplicate stage order 2"));
    }
}
