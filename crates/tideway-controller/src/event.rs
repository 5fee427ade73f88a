//! Change notifications flowing from watch sources through the queue.

use tideway_core::ResourceKey;

/// Kind of change observed for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The object appeared (initial listing or creation).
    Create,
    /// The object changed, or a resync re-delivered it.
    Update,
    /// The object was removed; the event carries its last known state.
    Delete,
}

impl EventType {
    /// Returns the lowercase event name used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change to one object, keyed for deduplication in the event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<T> {
    /// Key of the changed object.
    pub key: ResourceKey,
    /// Kind of change.
    pub event_type: EventType,
    /// Object snapshot; the tombstone for deletions.
    pub object: T,
}

impl<T> Event<T> {
    /// Creates a new event.
    #[must_use]
    pub const fn new(key: ResourceKey, event_type: EventType, object: T) -> Self {
        Self {
            key,
            event_type,
            object,
        }
    }
}
