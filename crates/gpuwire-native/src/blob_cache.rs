use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock;
use crate::{Blob, CacheKey};

/// Snapshot of cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

/// In-memory store of compiled artifacts keyed by [`CacheKey`], shared by every
/// device of an instance.
#[derive(Debug, Default)]
pub struct BlobCache {
    entries: Mutex<HashMap<CacheKey, Arc<Blob>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, key: &CacheKey) -> Option<Arc<Blob>> {
        let found = lock(&self.entries).get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Stores `blob` under `key`, replacing any previous entry.
    pub fn store(&self, key: CacheKey, blob: Blob) -> Arc<Blob> {
        let blob = Arc::new(blob);
        lock(&self.entries).insert(key, Arc::clone(&blob));
        blob
    }

    /// Returns the cached blob for `key`, building and storing it on a miss.
    /// `build` runs without the lock held; if two threads race, the first stored
    /// blob wins.
    pub fn get_or_insert_with(&self, key: &CacheKey, build: impl FnOnce() -> Blob) -> Arc<Blob> {
        if let Some(blob) = self.load(key) {
            return blob;
        }
        let blob = Arc::new(build());
        Arc::clone(lock(&self.entries).entry(key.clone()).or_insert(blob))
    }

    pub fn stats(&self) -> BlobCacheStats {
        BlobCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: lock(&self.entries).len() as u64,
        }
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
