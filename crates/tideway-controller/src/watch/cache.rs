//! Local mirror of watched objects.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tideway_core::ResourceKey;

use crate::resource::Resource;

/// Keyed snapshot of the objects an informer has observed.
///
/// Writes carrying an older `resource_version` than the cached object are
/// ignored, so redelivered or reordered watch events never roll the cache back.
#[derive(Debug)]
pub struct Cache<T> {
    objects: RwLock<HashMap<ResourceKey, T>>,
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Resource> Cache<T> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ResourceKey, T>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ResourceKey, T>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached object for `key`.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<T> {
        self.read().get(key).cloned()
    }

    /// Returns every cached object.
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        self.read().values().cloned().collect()
    }

    /// Returns the number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stores `object` unless a newer version is already cached.
    ///
    /// Returns true if the cache changed.
    pub fn upsert(&self, key: ResourceKey, object: T) -> bool {
        let mut objects = self.write();
        if let Some(existing) = objects.get(&key) {
            if existing.meta().resource_version > object.meta().resource_version {
                return false;
            }
        }
        objects.insert(key, object);
        true
    }

    /// Removes the object for `key` unless a newer version is cached.
    ///
    /// Returns the removed object.
    pub fn remove(&self, key: &ResourceKey, tombstone: &T) -> Option<T> {
        let mut objects = self.write();
        let newer = objects
            .get(key)
            .is_some_and(|existing| existing.meta().resource_version > tombstone.meta().resource_version);
        if newer {
            return None;
        }
        objects.remove(key)
    }

    /// Replaces the whole cache with a fresh listing.
    ///
    /// Returns the objects that were cached but are absent from the listing.
    pub fn replace(&self, listed: Vec<(ResourceKey, T)>) -> Vec<(ResourceKey, T)> {
        let mut fresh: HashMap<ResourceKey, T> = listed.into_iter().collect();
        let mut objects = self.write();
        let vanished = objects
            .drain()
            .filter(|(key, _)| !fresh.contains_key(key))
            .collect();
        std::mem::swap(&mut *objects, &mut fresh);
        vanished
    }
}
