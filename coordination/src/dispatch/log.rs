//! Dispatcher that only logs
//!
//! Used for dry runs and for method types with no transport configured.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{DispatchPayload, DispatchResult, Dispatcher};
use crate::chain::DeliveryMethod;

#[derive(Debug, Clone, Default)]
pub struct LogDispatcher;

impl LogDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn send(&self, method: &DeliveryMethod, payload: &DispatchPayload) -> DispatchResult {
        let delivery_id = format!("log-{}", Uuid::new_v4());
        info!(
            instance_id = %payload.instance_id,
            chain_id = %payload.chain_id,
            method_id = %method.id,
            method_type = %method.method_type,
            stage = payload.stage_order,
            attempt = payload.attempt,
            delivery_id = %delivery_id,
            "Notification dispatched (log only)"
        );
        DispatchResult::delivered(delivery_id)
    }
}
