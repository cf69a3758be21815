//! The two associative containers over live chains.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cdr::CdrChain;

/// Chains keyed by Party-A channel name. A chain is present exactly while
/// its channel is live upstream.
#[derive(Debug, Default)]
pub struct ChannelIndex {
    inner: RwLock<HashMap<String, Arc<CdrChain>>>,
}

impl ChannelIndex {
    pub fn insert(&self, chain: Arc<CdrChain>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chain.name().to_string(), chain);
    }

    pub fn get(&self, name: &str) -> Option<Arc<CdrChain>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Snapshot of every live chain; callers lock chains one at a time.
    pub fn all(&self) -> Vec<Arc<CdrChain>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chains currently participating in each bridge.
#[derive(Debug, Default)]
pub struct BridgeIndex {
    inner: RwLock<HashMap<String, HashMap<String, Arc<CdrChain>>>>,
}

impl BridgeIndex {
    pub fn insert(&self, bridge_id: &str, chain: Arc<CdrChain>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(bridge_id.to_string())
            .or_default()
            .insert(chain.name().to_string(), chain);
    }

    /// Remove one chain from one bridge.
    pub fn remove(&self, bridge_id: &str, chain_name: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(chains) = inner.get_mut(bridge_id) {
            chains.remove(chain_name);
            if chains.is_empty() {
                inner.remove(bridge_id);
            }
        }
    }

    /// Remove a chain from every bridge; used when its channel goes away.
    pub fn remove_chain(&self, chain_name: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.retain(|_, chains| {
            chains.remove(chain_name);
            !chains.is_empty()
        });
    }

    /// Snapshot of the chains in a bridge.
    pub fn chains(&self, bridge_id: &str) -> Vec<Arc<CdrChain>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(bridge_id)
            .map(|chains| chains.values().cloned().collect())
            .unwrap_or_default()
    }
}
