//! Error types for the controller domain.
//!
//! Every error is classified as either [`ErrorClass::Transient`] (retry with
//! backoff) or [`ErrorClass::Permanent`] (log and drop). The controller's
//! worker loop uses the classification to decide whether a key goes back on
//! the queue.

use tideway_core::ResourceKey;

/// The result type used throughout tideway-controller.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Store contention, unavailable collaborators: retry with backoff.
    Transient,
    /// Malformed objects, invalid transitions: retrying cannot help.
    Permanent,
}

/// Errors that can occur in controller operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An optimistic-concurrency write lost against a newer stored version.
    #[error("conflict writing {key}: expected version {expected}, found {actual}")]
    Conflict {
        /// Key of the object being written.
        key: ResourceKey,
        /// Resource version the writer read.
        expected: u64,
        /// Resource version currently stored.
        actual: u64,
    },

    /// The object does not exist in the store.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Key that was looked up.
        key: ResourceKey,
    },

    /// The object already exists in the store.
    #[error("{kind} already exists: {key}")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Key that collided.
        key: ResourceKey,
    },

    /// The object is malformed or misses a required field.
    #[error("invalid {kind} {key}: {message}")]
    InvalidObject {
        /// Resource kind.
        kind: &'static str,
        /// Key of the offending object.
        key: ResourceKey,
        /// What is wrong with it.
        message: String,
    },

    /// An invalid phase transition was attempted.
    #[error("invalid phase transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current phase.
        from: String,
        /// The attempted target phase.
        to: String,
        /// Why the transition is invalid.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The message broker could not be reached or rejected a message.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// A lifecycle method was called in the wrong state.
    #[error("{component} cannot {action} while {state}")]
    Lifecycle {
        /// Component name.
        component: String,
        /// The attempted action.
        action: &'static str,
        /// The current lifecycle state.
        state: String,
    },

    /// An error from tideway-core.
    #[error("core error: {0}")]
    Core(#[from] tideway_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Classifies the error for retry decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } | Self::Storage { .. } | Self::Transport { .. } => {
                ErrorClass::Transient
            }
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidObject { .. }
            | Self::InvalidStateTransition { .. }
            | Self::Serialization { .. }
            | Self::Configuration { .. }
            | Self::Lifecycle { .. }
            | Self::Core(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
