//! Admin wire schema for escalation chains
//!
//! Two shapes are persisted by the admin tooling:
//!
//! ```text
//! variant A ("steps"):  one method per step, retryCount = extra attempts
//! variant B ("stages"): a method set per stage, maxAttempts = total attempts
//! ```
//!
//! The only discriminant is which field is present. Both normalize into
//! [`EscalationChain`]; serialization always emits variant B.

use serde::{Deserialize, Serialize};

use super::{EscalationChain, EscalationStage, MethodId};
use crate::error::ConfigurationError;
use crate::escalation::policy::AllFailedPolicy;

/// Chain document as stored and exchanged by the admin CRUD layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDocument {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_failed_policy: Option<AllFailedPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepDocument>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageDocument>>,
}

/// Variant A step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDocument {
    pub method_id: MethodId,
    pub wait_time: i64,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default)]
    pub retry_interval: i64,
}

/// Variant B stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDocument {
    pub stage_order: i64,
    pub wait_duration_seconds: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default)]
    pub retry_interval_seconds: i64,
    #[serde(default)]
    pub delivery_methods: Vec<DeliveryMethodRef>,
}

fn default_max_attempts() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMethodRef {
    pub method_id: MethodId,
}

impl ChainDocument {
    /// Normalize either variant into the canonical chain and validate it.
    pub fn normalize(&self) -> Result<EscalationChain, ConfigurationError> {
        let steps = self.steps.as_deref().filter(|s| !s.is_empty());
        let stages = self.stages.as_deref().filter(|s| !s.is_empty());

        let normalized = match (steps, stages) {
            (Some(_), Some(_)) => {
                return Err(ConfigurationError::AmbiguousSchema {
                    chain_id: self.id.clone(),
                })
            }
            (Some(steps), None) => self.normalize_steps(steps)?,
            (None, Some(stages)) => self.normalize_stages(stages)?,
            (None, None) => Vec::new(),
        };

        let chain = EscalationChain {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            is_enabled: self.is_enabled,
            stages: normalized,
            all_failed_policy: self.all_failed_policy,
        };
        chain.validate()?;
        Ok(chain)
    }

    fn normalize_steps(
        &self,
        steps: &[StepDocument],
    ) -> Result<Vec<EscalationStage>, ConfigurationError> {
        steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let order = index as u32 + 1;
                let wait = non_negative(&self.id, order, "waitTime", step.wait_time)?;
                let retries = non_negative(&self.id, order, "retryCount", step.retry_count)?;
                let interval = non_negative(&self.id, order, "retryInterval", step.retry_interval)?;
                let max_attempts = u32::try_from(retries + 1).map_err(|_| {
                    ConfigurationError::invalid_stage(&self.id, order, "retryCount out of range")
                })?;
                Ok(EscalationStage::new(order, vec![step.method_id.clone()], wait)
                    .with_retries(max_attempts, interval))
            })
            .collect()
    }

    fn normalize_stages(
        &self,
        stages: &[StageDocument],
    ) -> Result<Vec<EscalationStage>, ConfigurationError> {
        let mut out = Vec::with_capacity(stages.len());
        for doc in stages {
            let order = u32::try_from(doc.stage_order)
                .ok()
                .filter(|o| *o >= 1)
                .ok_or_else(|| {
                    ConfigurationError::invalid_chain(
                        &self.id,
                        format!("stageOrder must be >= 1, got {}", doc.stage_order),
                    )
                })?;
            let wait = non_negative(&self.id, order, "waitDurationSeconds", doc.wait_duration_seconds)?;
            let interval = non_negative(
                &self.id,
                order,
                "retryIntervalSeconds",
                doc.retry_interval_seconds,
            )?;
            let max_attempts = u32::try_from(doc.max_attempts)
                .ok()
                .filter(|m| *m >= 1)
                .ok_or_else(|| {
                    ConfigurationError::invalid_stage(
                        &self.id,
                        order,
                        format!("maxAttempts must be >= 1, got {}", doc.max_attempts),
                    )
                })?;
            let methods = doc
                .delivery_methods
                .iter()
                .map(|m| m.method_id.clone())
                .collect();
            out.push(EscalationStage::new(order, methods, wait).with_retries(max_attempts, interval));
        }
        // Persisted order is not trusted; validation then checks density.
        out.sort_by_key(|s| s.stage_order);
        Ok(out)
    }
}

fn non_negative(
    chain_id: &str,
    stage_order: u32,
    field: &str,
    value: i64,
) -> Result<u64, ConfigurationError> {
    u64::try_from(value).map_err(|_| {
        ConfigurationError::invalid_stage(
            chain_id,
            stage_order,
            format!("{} must not be negative, got {}", field, value),
        )
    })
}

impl From<&EscalationChain> for ChainDocument {
    fn from(chain: &EscalationChain) -> Self {
        Self {
            id: chain.id.clone(),
            name: chain.name.clone(),
            description: chain.description.clone(),
            is_enabled: chain.is_enabled,
            all_failed_policy: chain.all_failed_policy,
            steps: None,
            stages: Some(
                chain
                    .stages
                    .iter()
                    .map(|s| StageDocument {
                        stage_order: i64::from(s.stage_order),
                        wait_duration_seconds: s.wait_duration_secs as i64,
                        max_attempts: i64::from(s.max_attempts),
                        retry_interval_seconds: s.retry_interval_secs as i64,
                        delivery_methods: s
                            .delivery_methods
                            .iter()
                            .map(|m| DeliveryMethodRef {
                                method_id: m.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
            ),
        }
    }
}
