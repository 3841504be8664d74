//! Chain and delivery-method stores
//!
//! The engine only reads through these traits, and it reads at every
//! transition: definitions may be edited by the admin tooling while an
//! escalation is in flight. [`MemoryStore`] backs both traits for a single
//! process and can be seeded from a JSON file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ChainDocument, ChainId, DeliveryMethod, EscalationChain, MethodId};
use crate::error::StoreError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a chain store
pub type SharedChainStore = Arc<dyn ChainStore>;

/// Shared reference to a method store
pub type SharedMethodStore = Arc<dyn MethodStore>;

/// Admin CRUD contract for escalation chains
pub trait ChainStore: Send + Sync {
    fn get(&self, id: &str) -> StoreResult<Option<EscalationChain>>;
    fn list(&self) -> StoreResult<Vec<EscalationChain>>;
    fn create(&self, chain: EscalationChain) -> StoreResult<()>;
    fn update(&self, id: &str, chain: EscalationChain) -> StoreResult<()>;
    fn delete(&self, id: &str) -> StoreResult<()>;
    fn enable(&self, id: &str) -> StoreResult<()>;
    fn disable(&self, id: &str) -> StoreResult<()>;
}

/// Directory of delivery methods, resolved at dispatch time
pub trait MethodStore: Send + Sync {
    fn get(&self, id: &str) -> StoreResult<Option<DeliveryMethod>>;
    fn list(&self) -> StoreResult<Vec<DeliveryMethod>>;
    fn put(&self, method: DeliveryMethod) -> StoreResult<()>;
    fn remove(&self, id: &str) -> StoreResult<()>;
}

/// On-disk seed format: `{ "methods": [...], "chains": [...] }`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub methods: Vec<DeliveryMethod>,
    #[serde(default)]
    pub chains: Vec<ChainDocument>,
}

/// In-process store backing both [`ChainStore`] and [`MethodStore`]
#[derive(Default)]
pub struct MemoryStore {
    chains: RwLock<HashMap<ChainId, EscalationChain>>,
    methods: RwLock<HashMap<MethodId, DeliveryMethod>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Build a store from a seed document
    pub fn from_seed(seed: SeedFile) -> StoreResult<Self> {
        let store = Self::new();
        for method in seed.methods {
            MethodStore::put(&store, method)?;
        }
        for doc in seed.chains {
            let chain = doc.normalize()?;
            ChainStore::create(&store, chain)?;
        }
        Ok(store)
    }

    /// Load a JSON seed file from disk
    pub fn load_json(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let seed: SeedFile = serde_json::from_str(&raw)?;
        let store = Self::from_seed(seed)?;
        info!(
            path = %path.display(),
            chains = store.chain_count(),
            "Loaded escalation seed file"
        );
        Ok(store)
    }

    pub fn chain_count(&self) -> usize {
        self.chains.read().map(|c| c.len()).unwrap_or(0)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> StoreResult<()> {
        let mut chains = self.chains.write().map_err(|_| StoreError::LockPoisoned)?;
        let chain = chains
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        chain.is_enabled = enabled;
        debug!(chain_id = id, enabled, "Chain enablement changed");
        Ok(())
    }
}

impl ChainStore for MemoryStore {
    fn get(&self, id: &str) -> StoreResult<Option<EscalationChain>> {
        let chains = self.chains.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(chains.get(id).cloned())
    }

    fn list(&self) -> StoreResult<Vec<EscalationChain>> {
        let chains = self.chains.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<EscalationChain> = chains.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn create(&self, chain: EscalationChain) -> StoreResult<()> {
        chain.validate()?;
        let mut chains = self.chains.write().map_err(|_| StoreError::LockPoisoned)?;
        if chains.contains_key(&chain.id) {
            return Err(StoreError::AlreadyExists(chain.id));
        }
        debug!(chain_id = %chain.id, stages = chain.stages.len(), "Chain created");
        chains.insert(chain.id.clone(), chain);
        Ok(())
    }

    fn update(&self, id: &str, mut chain: EscalationChain) -> StoreResult<()> {
        chain.id = id.to_string();
        chain.validate()?;
        let mut chains = self.chains.write().map_err(|_| StoreError::LockPoisoned)?;
        let slot = chains
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        *slot = chain;
        debug!(chain_id = id, "Chain updated");
        Ok(())
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        let mut chains = self.chains.write().map_err(|_| StoreError::LockPoisoned)?;
        chains
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn enable(&self, id: &str) -> StoreResult<()> {
        self.set_enabled(id, true)
    }

    fn disable(&self, id: &str) -> StoreResult<()> {
        self.set_enabled(id, false)
    }
}

impl MethodStore for MemoryStore {
    fn get(&self, id: &str) -> StoreResult<Option<DeliveryMethod>> {
        let methods = self.methods.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(methods.get(id).cloned())
    }

    fn list(&self) -> StoreResult<Vec<DeliveryMethod>> {
        let methods = self.methods.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<DeliveryMethod> = methods.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn put(&self, method: DeliveryMethod) -> StoreResult<()> {
        let mut methods = self.methods.write().map_err(|_| StoreError::LockPoisoned)?;
        methods.insert(method.id.clone(), method);
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        let mut methods = self.methods.write().map_err(|_| StoreError::LockPoisoned)?;
        methods
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
