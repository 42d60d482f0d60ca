//! Capability negotiation state.
//!
//! Peers may announce their capabilities as the hash of a capability set
//! instead of the full list. `CapabilityCache` resolves known hashes;
//! `PeerCapabilities` remembers what each peer negotiated.

use std::sync::{Mutex, MutexGuard};

use lru::LruCache;

use rains_core::wire::capability_set_hash;
use rains_core::{Capability, ConnInfo};

use crate::conn_cache::{capacity, CacheError};

/// Capability-set hash → decoded set.
pub struct CapabilityCache {
    inner: Mutex<LruCache<String, Vec<Capability>>>,
}

impl CapabilityCache {
    pub fn new(size: usize) -> Result<Self, CacheError> {
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity("capability cache", size)?)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Vec<Capability>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a set under its computed hash. Returns the hash.
    pub fn insert(&self, capabilities: &[Capability]) -> String {
        let hash = capability_set_hash(capabilities);
        let mut set = capabilities.to_vec();
        set.sort();
        set.dedup();
        self.lock().put(hash.clone(), set);
        hash
    }

    pub fn get(&self, hash: &str) -> Option<Vec<Capability>> {
        self.lock().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the capability field of a message: a known hash first,
    /// then a single capability literal. `None` if it is neither.
    pub fn resolve(&self, value: &str) -> Option<Vec<Capability>> {
        self.get(value)
            .or_else(|| Capability::from_literal(value).map(|c| vec![c]))
    }
}

/// Peer → negotiated capabilities.
pub struct PeerCapabilities {
    inner: Mutex<LruCache<ConnInfo, Vec<Capability>>>,
}

impl PeerCapabilities {
    pub fn new(size: usize) -> Result<Self, CacheError> {
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity("peer capability cache", size)?)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<ConnInfo, Vec<Capability>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, peer: ConnInfo, capabilities: Vec<Capability>) {
        self.lock().put(peer, capabilities);
    }

    pub fn get(&self, peer: &ConnInfo) -> Option<Vec<Capability>> {
        self.lock().get(peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
