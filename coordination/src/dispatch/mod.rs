//! Delivery dispatch
//!
//! The engine treats delivery as a capability: one [`Dispatcher::send`] call
//! per method per attempt, fire-and-report. Sends run on their own tasks
//! and never hold up the instance's wait window.

pub mod log;
pub mod recording;
pub mod router;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::chain::{ChainId, DeliveryMethod, MethodId};
use crate::error::DispatchError;
use crate::escalation::InstanceId;

pub use log::LogDispatcher;
pub use recording::{RecordedSend, RecordingDispatcher};
pub use router::MethodRouter;
pub use webhook::WebhookDispatcher;

/// Everything an adapter needs to render one notification attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    pub instance_id: InstanceId,
    pub chain_id: ChainId,
    pub stage_order: u32,
    pub attempt: u32,
    pub alert: serde_json::Value,
}

/// Result of one send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

impl DispatchResult {
    pub fn delivered(delivery_id: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            delivery_id: Some(delivery_id.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            delivery_id: None,
        }
    }
}

impl From<DispatchError> for DispatchResult {
    fn from(err: DispatchError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<Result<String, DispatchError>> for DispatchResult {
    fn from(result: Result<String, DispatchError>) -> Self {
        match result {
            Ok(delivery_id) => Self::delivered(delivery_id),
            Err(err) => err.into(),
        }
    }
}

/// Dispatch result reported for an instance, either by the engine's own
/// send task or through the external callback channel.
///
/// `stage_order` and `attempt` default to the instance's current ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub method_id: MethodId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(flatten)]
    pub result: DispatchResult,
}

/// Thread-safe reference to a dispatcher
pub type SharedDispatcher = Arc<dyn Dispatcher>;

/// Sends one notification attempt through one delivery method
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, method: &DeliveryMethod, payload: &DispatchPayload) -> DispatchResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_converts_to_failed_result() {
        let result: DispatchResult = DispatchError::MethodDisabled {
            method_id: "sms".into(),
        }
        .into();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Delivery method is disabled: sms")
        );
    }

    #[test]
    fn test_report_wire_format_is_flat() {
        let report: DispatchReport = serde_json::from_value(serde_json::json!({
            "methodId": "voice",
            "attempt": 2,
            "success": false,
            "error": "no answer"
        }))
        .unwrap();
        assert_eq!(report.attempt, Some(2));
        assert_eq!(report.stage_order, None);
        assert_eq!(report.result, DispatchResult::failed("no answer"));
    }
}
