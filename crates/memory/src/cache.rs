//! LRU cache fronting hot profile reads.
//!
//! Keys are `(user_id, canonical isolations)` pairs; values are full
//! [`ProfileView`] snapshots.  The cache is best-effort: every profile write
//! erases the affected key, and a poisoned lock degrades to the inner value
//! rather than surfacing an error.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::error::{MemoryError, Result};
use crate::schema::{Isolations, ProfileView, canonical_isolations};

type CacheKey = (String, String);

pub struct ProfileCache {
    inner: Mutex<LruCache<CacheKey, ProfileView>>,
}

impl ProfileCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            MemoryError::InvalidInput("cache capacity must be positive".to_string())
        })?;
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn key(user_id: &str, isolations: &Isolations) -> CacheKey {
        (user_id.to_string(), canonical_isolations(isolations))
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, ProfileView>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch a cached view, promoting the key to most-recently-used.
    pub fn get(&self, user_id: &str, isolations: &Isolations) -> Option<ProfileView> {
        self.lock().get(&Self::key(user_id, isolations)).cloned()
    }

    /// Insert (or refresh) a view, evicting the least-recently-used entry when
    /// the cache is full.
    pub fn put(&self, user_id: &str, isolations: &Isolations, view: ProfileView) {
        self.lock().put(Self::key(user_id, isolations), view);
    }

    pub fn erase(&self, user_id: &str, isolations: &Isolations) {
        self.lock().pop(&Self::key(user_id, isolations));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
