//! Bounded LRU cache of open peer connections.
//!
//! Keyed by (local, remote) so one logical connection maps to exactly one
//! entry. Every connection that leaves the cache, whether evicted by
//! capacity or displaced by a newer connection under the same key, is
//! closed on the way out.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use rains_core::ConnInfo;

use crate::switchboard::connection::PeerConnection;

/// Cache key: our identity plus the peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPair {
    pub local: ConnInfo,
    pub remote: ConnInfo,
}

impl AddressPair {
    pub fn new(local: ConnInfo, remote: ConnInfo) -> Self {
        Self { local, remote }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{0} capacity must be greater than zero")]
    ZeroCapacity(&'static str),
}

/// Validate a configured cache size.
pub(crate) fn capacity(name: &'static str, size: usize) -> Result<NonZeroUsize, CacheError> {
    NonZeroUsize::new(size).ok_or(CacheError::ZeroCapacity(name))
}

pub struct ConnectionCache {
    inner: Mutex<LruCache<AddressPair, Arc<PeerConnection>>>,
}

impl ConnectionCache {
    pub fn new(size: usize) -> Result<Self, CacheError> {
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity("connection cache", size)?)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<AddressPair, Arc<PeerConnection>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or refresh `key`. Whatever connection this pushes out is closed.
    pub fn add(&self, key: AddressPair, conn: Arc<PeerConnection>) {
        let displaced = self.lock().push(key, conn.clone());
        if let Some((old_key, old)) = displaced {
            if !Arc::ptr_eq(&old, &conn) {
                tracing::debug!(remote = %old_key.remote, "closing connection leaving cache");
                old.close();
            }
        }
    }

    /// Look up `key`, refreshing its recency.
    pub fn get(&self, key: &AddressPair) -> Option<Arc<PeerConnection>> {
        self.lock().get(key).cloned()
    }

    /// Drop `key` only if it still holds `conn`. Returns whether it did.
    pub fn remove_if_same(&self, key: &AddressPair, conn: &Arc<PeerConnection>) -> bool {
        let mut cache = self.lock();
        match cache.peek(key) {
            Some(cached) if Arc::ptr_eq(cached, conn) => {
                cache.pop(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every cached connection.
    pub fn close_all(&self) {
        let mut cache = self.lock();
        for (_, conn) in cache.iter() {
            conn.close();
        }
        cache.clear();
    }
}
