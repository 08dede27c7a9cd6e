//! Process-lifetime map from cache key to engine.
//!
//! The map is lazily materialized: a fresh cache holds no map at all, and
//! the first write (or an explicit [`EngineCache::reset_all`]) creates it.
//! All operations go through one `RwLock`, so a lookup-or-construct
//! ([`EngineCache::get_or_insert_with`]) never races with a reset.
//!
//! The cache never destroys engines. Replaced and discarded entries are
//! handed back to the caller; an engine dies when its last handle drops.

use crate::engine::EngineHandle;
use crate::error::EngineError;
use cinder_types::CacheKey;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Shared mapping from [`CacheKey`] to [`EngineHandle`].
#[derive(Debug, Default)]
pub struct EngineCache {
    slot: RwLock<Option<HashMap<CacheKey, EngineHandle>>>,
}

impl EngineCache {
    /// Creates an uninitialized cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached engine for `key`.
    ///
    /// Absent and never-initialized are both reported as `None`.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<EngineHandle> {
        self.slot
            .read()
            .as_ref()
            .and_then(|map| map.get(key).cloned())
    }

    /// Inserts or overwrites the entry for `key`.
    ///
    /// Returns the engine previously stored under `key`.
    pub fn put(&self, key: CacheKey, engine: EngineHandle) -> Option<EngineHandle> {
        self.slot
            .write()
            .get_or_insert_with(HashMap::new)
            .insert(key, engine)
    }

    /// Removes every entry, leaving a fresh empty map.
    ///
    /// Returns the discarded entries.
    pub fn reset_all(&self) -> Vec<(CacheKey, EngineHandle)> {
        let previous = self.slot.write().replace(HashMap::new());
        previous
            .map(|map| map.into_iter().collect())
            .unwrap_or_default()
    }

    /// Returns the entry for `key`, constructing and storing it on a miss.
    ///
    /// The boolean is `true` when the engine was served from the cache.
    /// `create` runs under the write lock; it must not touch this cache.
    ///
    /// # Errors
    ///
    /// Propagates the error of `create`; the cache is left untouched.
    pub fn get_or_insert_with<F>(
        &self,
        key: &CacheKey,
        create: F,
    ) -> Result<(EngineHandle, bool), EngineError>
    where
        F: FnOnce() -> Result<EngineHandle, EngineError>,
    {
        if let Some(engine) = self.get(key) {
            return Ok((engine, true));
        }

        let mut slot = self.slot.write();
        let map = slot.get_or_insert_with(HashMap::new);
        // Another writer may have filled the entry between the two locks.
        if let Some(engine) = map.get(key) {
            return Ok((engine.clone(), true));
        }

        let engine = create()?;
        map.insert(key.clone(), engine.clone());
        Ok((engine, false))
    }

    /// Number of cached engines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slot.read().as_ref().map_or(0, HashMap::len)
    }

    /// Returns true if no engine is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if an engine is cached under `key`.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slot
            .read()
            .as_ref()
            .is_some_and(|map| map.contains_key(key))
    }

    /// Cached keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .slot
            .read()
            .as_ref()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Returns true once the underlying map exists.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.slot.read().is_some()
    }
}
