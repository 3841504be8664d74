//! Escalation chain definitions
//!
//! The canonical, already-normalized shape the engine executes. Wire
//! documents (both admin schema variants) live in [`schema`]; the admin
//! CRUD contract and the in-memory implementation live in [`store`].

pub mod schema;
pub mod store;

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::escalation::policy::AllFailedPolicy;

/// Upper bound for a stage's wait window and retry interval (one year)
pub const MAX_STAGE_SECS: u64 = 365 * 24 * 60 * 60;

pub use schema::{ChainDocument, DeliveryMethodRef, StageDocument, StepDocument};
pub use store::{ChainStore, MemoryStore, MethodStore, SharedChainStore, SharedMethodStore};

/// Identifier of an escalation chain
pub type ChainId = String;

/// Identifier of a delivery method
pub type MethodId = String;

/// Channel a delivery method sends through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethodType {
    Email,
    Slack,
    Text,
    Voice,
    Webhook,
}

impl std::fmt::Display for DeliveryMethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "EMAIL"),
            Self::Slack => write!(f, "SLACK"),
            Self::Text => write!(f, "TEXT"),
            Self::Voice => write!(f, "VOICE"),
            Self::Webhook => write!(f, "WEBHOOK"),
        }
    }
}

/// A configured way of reaching people. The `config` blob is only
/// interpreted by the dispatcher adapter for `method_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMethod {
    pub id: MethodId,
    #[serde(rename = "type")]
    pub method_type: DeliveryMethodType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl DeliveryMethod {
    pub fn new(id: impl Into<MethodId>, method_type: DeliveryMethodType) -> Self {
        Self {
            id: id.into(),
            method_type,
            config: serde_json::Value::Null,
            is_enabled: true,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// One stage of a chain: a fan-out, a wait window and a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStage {
    /// 1-based position within the chain
    pub stage_order: u32,
    /// Methods fanned out together on every attempt (empty = delay only)
    pub delivery_methods: Vec<MethodId>,
    /// Time to wait for an ack after the final attempt
    pub wait_duration_secs: u64,
    /// Total attempts within this stage, at least 1
    pub max_attempts: u32,
    /// Time between attempts; always 0 when `max_attempts == 1`
    pub retry_interval_secs: u64,
}

impl EscalationStage {
    pub fn new(stage_order: u32, delivery_methods: Vec<MethodId>, wait_duration_secs: u64) -> Self {
        Self {
            stage_order,
            delivery_methods,
            wait_duration_secs,
            max_attempts: 1,
            retry_interval_secs: 0,
        }
    }

    /// Set attempts and spacing, normalizing the interval when unused
    pub fn with_retries(mut self, max_attempts: u32, retry_interval_secs: u64) -> Self {
        self.max_attempts = max_attempts;
        self.retry_interval_secs = if max_attempts <= 1 {
            0
        } else {
            retry_interval_secs
        };
        self
    }

    /// A stage with no delivery methods only paces the escalation
    pub fn is_delay_only(&self) -> bool {
        self.delivery_methods.is_empty()
    }

    pub fn wait_duration(&self) -> Duration {
        Duration::from_secs(self.wait_duration_secs)
    }

    /// Delay between two attempts of this stage.
    ///
    /// Falls back to the wait window when no interval is configured.
    pub fn retry_delay(&self) -> Duration {
        if self.max_attempts <= 1 {
            Duration::ZERO
        } else if self.retry_interval_secs > 0 {
            Duration::from_secs(self.retry_interval_secs)
        } else {
            self.wait_duration()
        }
    }

    /// Wall-clock span of the stage when nobody acknowledges
    pub fn total_span(&self) -> Duration {
        if self.is_delay_only() {
            return self.wait_duration();
        }
        self.retry_delay()
            .checked_mul(self.max_attempts.saturating_sub(1))
            .and_then(|retries| retries.checked_add(self.wait_duration()))
            .unwrap_or(Duration::MAX)
    }

    fn validate(&self, chain_id: &str) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid_stage(
                chain_id,
                self.stage_order,
                "max_attempts must be at least 1",
            ));
        }
        if self.wait_duration_secs > MAX_STAGE_SECS || self.retry_interval_secs > MAX_STAGE_SECS {
            return Err(ConfigurationError::invalid_stage(
                chain_id,
                self.stage_order,
                format!("durations are limited to {} seconds", MAX_STAGE_SECS),
            ));
        }
        let mut seen = HashSet::new();
        for method in &self.delivery_methods {
            if method.trim().is_empty() {
                return Err(ConfigurationError::invalid_stage(
                    chain_id,
                    self.stage_order,
                    "empty delivery method id",
                ));
            }
            if !seen.insert(method.as_str()) {
                return Err(ConfigurationError::invalid_stage(
                    chain_id,
                    self.stage_order,
                    format!("delivery method {} listed twice", method),
                ));
            }
        }
        Ok(())
    }
}

/// Ordered escalation policy for one type of alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationChain {
    pub id: ChainId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_enabled: bool,
    pub stages: Vec<EscalationStage>,
    /// Overrides the engine-wide all-failed policy for this chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_failed_policy: Option<AllFailedPolicy>,
}

impl EscalationChain {
    pub fn new(id: impl Into<ChainId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            is_enabled: true,
            stages: Vec::new(),
            all_failed_policy: None,
        }
    }

    /// Append a stage; its order is assigned from its position
    pub fn with_stage(mut self, mut stage: EscalationStage) -> Self {
        stage.stage_order = self.stages.len() as u32 + 1;
        self.stages.push(stage);
        self
    }

    pub fn with_all_failed_policy(mut self, policy: AllFailedPolicy) -> Self {
        self.all_failed_policy = Some(policy);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    /// A chain with no stages never dispatches
    pub fn is_inert(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&EscalationStage> {
        self.stages.get(index)
    }

    pub fn has_stage_after(&self, index: usize) -> bool {
        index + 1 < self.stages.len()
    }

    /// Time from trigger to `Exhausted` when nobody acknowledges
    pub fn total_span(&self) -> Duration {
        self.stages
            .iter()
            .map(EscalationStage::total_span)
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Check structural invariants: dense 1..N ordering and sane stages.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::invalid_chain(&self.id, "empty chain id"));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            let expected = index as u32 + 1;
            if stage.stage_order != expected {
                if self.stages[..index]
                    .iter()
                    .any(|s| s.stage_order == stage.stage_order)
                {
                    return Err(ConfigurationError::DuplicateStageOrder {
                        chain_id: self.id.clone(),
                        stage_order: stage.stage_order,
                    });
                }
                return Err(ConfigurationError::StageOrderGap {
                    chain_id: self.id.clone(),
                    expected,
                    found: stage.stage_order,
                });
            }
            stage.validate(&self.id)?;
        }
        Ok(())
    }
}
