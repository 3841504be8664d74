//! In-memory dispatcher that records every send
//!
//! Lets tests and dry runs observe exactly which methods were sent, for
//! which stage and attempt, and at which (tokio) instant. Individual methods
//! can be scripted to fail or to stall.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DispatchPayload, DispatchResult, Dispatcher};
use crate::chain::{DeliveryMethod, DeliveryMethodType, MethodId};

/// One observed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSend {
    pub method_id: MethodId,
    pub method_type: DeliveryMethodType,
    pub instance_id: String,
    pub stage_order: u32,
    pub attempt: u32,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Script {
    failing: HashSet<MethodId>,
    delays: HashMap<MethodId, Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    sends: Arc<Mutex<Vec<RecordedSend>>>,
    script: Arc<Mutex<Script>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send through `method_id` reports failure
    pub fn fail_method(&self, method_id: impl Into<MethodId>) {
        if let Ok(mut script) = self.script.lock() {
            script.failing.insert(method_id.into());
        }
    }

    /// Sends through `method_id` take `delay` before reporting
    pub fn delay_method(&self, method_id: impl Into<MethodId>, delay: Duration) {
        if let Ok(mut script) = self.script.lock() {
            script.delays.insert(method_id.into(), delay);
        }
    }

    pub fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sends_for(&self, instance_id: &str) -> Vec<RecordedSend> {
        self.sends()
            .into_iter()
            .filter(|s| s.instance_id == instance_id)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sends) = self.sends.lock() {
            sends.clear();
        }
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn send(&self, method: &DeliveryMethod, payload: &DispatchPayload) -> DispatchResult {
        let seq = {
            let Ok(mut sends) = self.sends.lock() else {
                return DispatchResult::failed("recorder lock poisoned");
            };
            sends.push(RecordedSend {
                method_id: method.id.clone(),
                method_type: method.method_type,
                instance_id: payload.instance_id.clone(),
                stage_order: payload.stage_order,
                attempt: payload.attempt,
                at: Instant::now(),
            });
            sends.len()
        };

        let (fails, delay) = match self.script.lock() {
            Ok(script) => (
                script.failing.contains(&method.id),
                script.delays.get(&method.id).copied(),
            ),
            Err(_) => (false, None),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if fails {
            DispatchResult::failed(format!("{} unavailable", method.id))
        } else {
            DispatchResult::delivered(format!("rec-{}", seq))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(attempt: u32) -> DispatchPayload {
        DispatchPayload {
            instance_id: "i-1".into(),
            chain_id: "c".into(),
            stage_order: 1,
            attempt,
            alert: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_records_sends_and_scripted_failures() {
        let recorder = RecordingDispatcher::new();
        recorder.fail_method("voice");
        let slack = DeliveryMethod::new("slack", DeliveryMethodType::Slack);
        let voice = DeliveryMethod::new("voice", DeliveryMethodType::Voice);

        assert!(recorder.send(&slack, &payload(1)).await.success);
        let failed = recorder.send(&voice, &payload(2)).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("voice unavailable"));

        let sends = recorder.sends();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[1].method_type, DeliveryMethodType::Voice);
        assert_eq!(sends[1].attempt, 2);
        assert_eq!(recorder.sends_for("other").len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_method_reports_later() {
        let recorder = RecordingDispatcher::new();
        recorder.delay_method("email", Duration::from_secs(5));
        let email = DeliveryMethod::new("email", DeliveryMethodType::Email);

        let start = Instant::now();
        recorder.send(&email, &payload(1)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(recorder.sends()[0].at, start);
    }
}
