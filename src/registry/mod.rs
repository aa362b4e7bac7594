//! Agent descriptor store
//!
//! Process-scoped, read-mostly cache of descriptors keyed by agent id, with a
//! secondary index from the address a descriptor was resolved from. Pure
//! cache: no network I/O happens here. An entry exists only after a
//! successful discovery fetch.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::domain::{AgentDescriptor, AgentId, AgentSummary};

#[derive(Default)]
struct StoreInner {
    by_id: HashMap<AgentId, Arc<AgentDescriptor>>,
    by_address: HashMap<String, AgentId>,
}

/// Thread-safe registry of known remote agents
#[derive(Default)]
pub struct DescriptorStore {
    inner: RwLock<StoreInner>,
}

/// Trailing slashes are not significant in agent addresses
pub fn normalize_address(address: &str) -> String {
    address.trim().trim_end_matches('/').to_string()
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a descriptor by agent id
    pub fn get(&self, id: &AgentId) -> Option<Arc<AgentDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.get(id).cloned()
    }

    /// Look up a descriptor by the address it was resolved from
    pub fn get_by_address(&self, address: &str) -> Option<Arc<AgentDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_address
            .get(&normalize_address(address))
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Insert or wholesale replace the descriptor resolved from `address`
    pub fn upsert(&self, address: &str, descriptor: AgentDescriptor) -> Arc<AgentDescriptor> {
        let id = descriptor.id();
        let descriptor = Arc::new(descriptor);
        let address = normalize_address(address);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // An address that now serves a different agent drops the old agent.
        if let Some(previous) = inner.by_address.insert(address.clone(), id.clone()) {
            if previous != id {
                inner.by_id.remove(&previous);
                debug!(agent = %previous, address = %address, "Address now serves a different agent");
            }
        }
        inner.by_id.insert(id.clone(), descriptor.clone());
        debug!(agent = %id, address = %address, "Descriptor stored");
        descriptor
    }

    /// Drop an agent so the next lookup forces a fresh discovery fetch
    pub fn invalidate(&self, id: &AgentId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.by_id.remove(id).is_some();
        inner.by_address.retain(|_, agent| agent != id);
        if removed {
            debug!(agent = %id, "Descriptor invalidated");
        }
        removed
    }

    /// Drop whatever agent was resolved from `address`
    pub fn invalidate_address(&self, address: &str) -> bool {
        let id = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.by_address.get(&normalize_address(address)).cloned()
        };
        id.map_or(false, |id| self.invalidate(&id))
    }

    /// Snapshot of every registered descriptor
    pub fn all(&self) -> Vec<Arc<AgentDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = inner.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Name and description of every registered agent
    pub fn roster(&self) -> Vec<AgentSummary> {
        self.all().iter().map(|d| AgentSummary::from(d.as_ref())).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
