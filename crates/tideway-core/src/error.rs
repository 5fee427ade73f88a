//! Error types and result aliases for Tideway primitives.

/// The result type used by `tideway-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while parsing or validating Tideway primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An object UID could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A resource key could not be parsed or validated.
    #[error("invalid resource key '{key}': {message}")]
    InvalidKey {
        /// The offending key text.
        key: String,
        /// Description of the problem.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid key error.
    #[must_use]
    pub fn invalid_key(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: message.into(),
        }
    }
}
