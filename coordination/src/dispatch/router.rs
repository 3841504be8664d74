//! Routes each send to the adapter registered for the method's type

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{DispatchPayload, DispatchResult, Dispatcher, SharedDispatcher};
use crate::chain::{DeliveryMethod, DeliveryMethodType};
use crate::error::DispatchError;

#[derive(Clone, Default)]
pub struct MethodRouter {
    routes: HashMap<DeliveryMethodType, SharedDispatcher>,
    fallback: Option<SharedDispatcher>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method_type: DeliveryMethodType, dispatcher: SharedDispatcher) -> Self {
        self.routes.insert(method_type, dispatcher);
        self
    }

    /// Adapter for every type without an explicit route
    pub fn fallback(mut self, dispatcher: SharedDispatcher) -> Self {
        self.fallback = Some(dispatcher);
        self
    }

    pub fn has_route(&self, method_type: DeliveryMethodType) -> bool {
        self.routes.contains_key(&method_type) || self.fallback.is_some()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn resolve(&self, method_type: DeliveryMethodType) -> Option<&SharedDispatcher> {
        self.routes.get(&method_type).or(self.fallback.as_ref())
    }
}

impl std::fmt::Debug for MethodRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRouter")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl Dispatcher for MethodRouter {
    async fn send(&self, method: &DeliveryMethod, payload: &DispatchPayload) -> DispatchResult {
        match self.resolve(method.method_type) {
            Some(dispatcher) => dispatcher.send(method, payload).await,
            None => {
                warn!(
                    method_id = %method.id,
                    method_type = %method.method_type,
                    "No dispatcher for method type"
                );
                DispatchError::NoAdapter {
                    method_type: method.method_type,
                }
                .into()
            }
        }
    }
}
