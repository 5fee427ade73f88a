//! In-memory store implementation for testing and local runs.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation of
//! the [`ResourceStore`] and [`WatchSource`] traits.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **Unbounded watch buffers**: slow watchers accumulate events in memory

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use tideway_core::{ObjectUid, ResourceKey};

use super::ResourceStore;
use crate::error::{Error, Result};
use crate::resource::Resource;
use crate::watch::{WatchEvent, WatchFilter, WatchSource};

type Watcher<T> = (WatchFilter, mpsc::UnboundedSender<WatchEvent<T>>);

/// In-memory store for one resource kind.
///
/// Every write bumps the store version, which becomes the written object's
/// `resource_version`, and is fanned out to open watch streams.
///
/// ## Example
///
/// ```rust
/// use tideway_controller::model::WorkflowRun;
/// use tideway_controller::store::InMemoryStore;
///
/// let store: InMemoryStore<WorkflowRun> = InMemoryStore::new();
/// assert_eq!(store.len().unwrap(), 0);
/// ```
#[derive(Debug)]
pub struct InMemoryStore<T> {
    state: RwLock<State<T>>,
    watchers: Mutex<Vec<Watcher<T>>>,
    faults: Mutex<Faults>,
}

#[derive(Debug)]
struct State<T> {
    objects: HashMap<ResourceKey, T>,
    version: u64,
}

#[derive(Debug, Default)]
struct Faults {
    failing_updates: usize,
    failing_deletes: HashSet<ResourceKey>,
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self {
            state: RwLock::new(State {
                objects: HashMap::new(),
                version: 0,
            }),
            watchers: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl<T: Resource> InMemoryStore<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.objects.len()
        };
        Ok(count)
    }

    /// Returns true if the store holds no objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Makes the next `count` updates fail with a transient storage error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next_updates(&self, count: usize) -> Result<()> {
        self.faults.lock().map_err(poison_err)?.failing_updates = count;
        Ok(())
    }

    /// Makes deletes of `key` fail until [`Self::clear_faults`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_deletes_of(&self, key: ResourceKey) -> Result<()> {
        self.faults
            .lock()
            .map_err(poison_err)?
            .failing_deletes
            .insert(key);
        Ok(())
    }

    /// Removes every injected fault.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear_faults(&self) -> Result<()> {
        *self.faults.lock().map_err(poison_err)? = Faults::default();
        Ok(())
    }

    /// Ends every open watch stream, as an API server does on connection loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn disconnect_watchers(&self) -> Result<()> {
        self.watchers.lock().map_err(poison_err)?.clear();
        Ok(())
    }

    fn notify(&self, event: &WatchEvent<T>) -> Result<()> {
        let mut watchers = self.watchers.lock().map_err(poison_err)?;
        watchers.retain(|(filter, sender)| {
            if !filter.matches(event.object().meta()) {
                return !sender.is_closed();
            }
            sender.send(event.clone()).is_ok()
        });
        Ok(())
    }
}

#[async_trait]
impl<T: Resource> ResourceStore<T> for InMemoryStore<T> {
    async fn get(&self, key: &ResourceKey) -> Result<Option<T>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.objects.get(key).cloned()
        };
        Ok(result)
    }

    async fn list(&self) -> Result<Vec<T>> {
        let mut objects: Vec<T> = {
            let state = self.state.read().map_err(poison_err)?;
            state.objects.values().cloned().collect()
        };
        objects.sort_by_key(|o| o.meta().resource_version);
        Ok(objects)
    }

    async fn create(&self, mut object: T) -> Result<T> {
        let key = object.key()?;
        let created = {
            let mut state = self.state.write().map_err(poison_err)?;
            if state.objects.contains_key(&key) {
                return Err(Error::AlreadyExists { kind: T::KIND, key });
            }
            state.version += 1;
            let meta = object.meta_mut();
            meta.resource_version = state.version;
            if meta.uid.is_none() {
                meta.uid = Some(ObjectUid::generate());
            }
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = Some(Utc::now());
            }
            state.objects.insert(key, object.clone());
            self.notify(&WatchEvent::Added(object.clone()))?;
            object
        };
        Ok(created)
    }

    async fn update(&self, mut object: T) -> Result<T> {
        {
            let mut faults = self.faults.lock().map_err(poison_err)?;
            if faults.failing_updates > 0 {
                faults.failing_updates -= 1;
                return Err(Error::storage("injected update failure"));
            }
        }

        let key = object.key()?;
        let updated = {
            let mut state = self.state.write().map_err(poison_err)?;
            let next_version = state.version + 1;
            let Some(stored) = state.objects.get_mut(&key) else {
                return Err(Error::NotFound { kind: T::KIND, key });
            };
            let actual = stored.meta().resource_version;
            let expected = object.meta().resource_version;
            if actual != expected {
                return Err(Error::Conflict {
                    key,
                    expected,
                    actual,
                });
            }
            let meta = object.meta_mut();
            meta.resource_version = next_version;
            meta.uid = stored.meta().uid;
            meta.creation_timestamp = stored.meta().creation_timestamp;
            *stored = object.clone();
            state.version = next_version;
            self.notify(&WatchEvent::Modified(object.clone()))?;
            object
        };
        Ok(updated)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        if self
            .faults
            .lock()
            .map_err(poison_err)?
            .failing_deletes
            .contains(key)
        {
            return Err(Error::storage(format!("injected delete failure for {key}")));
        }

        let mut state = self.state.write().map_err(poison_err)?;
        let Some(object) = state.objects.remove(key) else {
            return Ok(false);
        };
        state.version += 1;
        // Notified under the write lock so watchers see writes in version order.
        self.notify(&WatchEvent::Deleted(object))?;
        drop(state);
        Ok(true)
    }
}

#[async_trait]
impl<T: Resource> WatchSource<T> for InMemoryStore<T> {
    async fn list(&self, filter: &WatchFilter) -> Result<Vec<T>> {
        let objects = <Self as ResourceStore<T>>::list(self).await?;
        Ok(objects
            .into_iter()
            .filter(|o| filter.matches(o.meta()))
            .collect())
    }

    async fn watch(&self, filter: &WatchFilter) -> Result<BoxStream<'static, WatchEvent<T>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .map_err(poison_err)?
            .push((filter.clone(), tx));
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}
