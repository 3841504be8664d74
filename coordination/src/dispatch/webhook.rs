//! HTTP webhook dispatcher
//!
//! Posts the payload as JSON to the method's `config.url`. Works for plain
//! webhooks and for Slack incoming webhooks, which get a `text` field.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DispatchPayload, DispatchResult, Dispatcher};
use crate::chain::{DeliveryMethod, DeliveryMethodType};
use crate::error::DispatchError;

/// Default request timeout for webhook posts
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post(
        &self,
        method: &DeliveryMethod,
        payload: &DispatchPayload,
    ) -> Result<String, DispatchError> {
        let url = target_url(method)?;
        let body = request_body(method, payload);

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Transport(format!(
                "non-success status {}",
                status
            )));
        }

        // Prefer an id the receiver hands back; fall back to our own
        let delivery_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(delivery_id)
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    async fn send(&self, method: &DeliveryMethod, payload: &DispatchPayload) -> DispatchResult {
        match self.post(method, payload).await {
            Ok(delivery_id) => {
                debug!(
                    method_id = %method.id,
                    instance_id = %payload.instance_id,
                    delivery_id = %delivery_id,
                    "Webhook delivered"
                );
                DispatchResult::delivered(delivery_id)
            }
            Err(e) => {
                warn!(
                    method_id = %method.id,
                    instance_id = %payload.instance_id,
                    error = %e,
                    "Webhook delivery failed"
                );
                e.into()
            }
        }
    }
}

fn target_url(method: &DeliveryMethod) -> Result<&str, DispatchError> {
    method
        .config
        .get("url")
        .and_then(|v| v.as_str())
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .ok_or_else(|| DispatchError::InvalidMethodConfig {
            method_id: method.id.clone(),
            reason: "config.url must be an http(s) URL".to_string(),
        })
}

fn request_body(method: &DeliveryMethod, payload: &DispatchPayload) -> serde_json::Value {
    match method.method_type {
        DeliveryMethodType::Slack => {
            let title = payload
                .alert
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("Alert");
            json!({
                "text": format!(
                    "{} (stage {}, attempt {})",
                    title, payload.stage_order, payload.attempt
                ),
                "metadata": payload,
            })
        }
        _ => serde_json::to_value(payload).unwrap_or_else(|_| json!({})),
    }
}
