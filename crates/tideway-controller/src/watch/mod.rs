//! Watch sources and the informer that mirrors them.
//!
//! A [`WatchSource`] is anything that can list a resource kind and stream
//! subsequent changes to it. Delivery is at-least-once: a source may
//! redeliver, it must not drop. The [`Informer`] turns a source into a local
//! [`Cache`] plus a stream of [`Event`](crate::event::Event)s on an
//! [`EventQueue`](crate::queue::EventQueue).

pub mod cache;
pub mod informer;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::resource::{ObjectMeta, Resource};

pub use cache::Cache;
pub use informer::{Informer, InformerConfig};

/// A change delivered by a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    /// The object was created.
    Added(T),
    /// The object was changed.
    Modified(T),
    /// The object was removed; carries its final state.
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// Returns the object carried by the event.
    #[must_use]
    pub const fn object(&self) -> &T {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }
}

/// Restricts which objects a watch delivers.
///
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    namespace: Option<String>,
    name: Option<String>,
    labels: BTreeMap<String, String>,
}

impl WatchFilter {
    /// Creates a filter matching every object.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Only matches objects in `namespace`.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Only matches the object named `name`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only matches objects carrying the label `key=value`.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns true if the object's metadata passes the filter.
    #[must_use]
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(namespace) = &self.namespace {
            if meta.namespace.as_ref() != Some(namespace) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &meta.name != name {
                return false;
            }
        }
        meta.matches_labels(&self.labels)
    }
}

/// Source of objects and change notifications for one resource kind.
///
/// Implementations must deliver every change at least once after `watch`
/// returns. Redelivery is allowed. When the returned stream ends, consumers
/// re-list and re-watch.
#[async_trait]
pub trait WatchSource<T: Resource>: Send + Sync {
    /// Lists every object passing `filter`.
    async fn list(&self, filter: &WatchFilter) -> Result<Vec<T>>;

    /// Streams changes to objects passing `filter`.
    async fn watch(&self, filter: &WatchFilter) -> Result<BoxStream<'static, WatchEvent<T>>>;
}
