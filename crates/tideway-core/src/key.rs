//! Namespace-qualified resource keys.
//!
//! A [`ResourceKey`] is the identity the controller uses for queueing,
//! caching and store lookups. Its textual form is `namespace/name` for
//! namespaced resources and `name` for cluster-scoped ones.
//!
//! # Example
//!
//! ```rust
//! use tideway_core::key::ResourceKey;
//!
//! let key: ResourceKey = "ci/build-42".parse().unwrap();
//! assert_eq!(key.namespace(), Some("ci"));
//! assert_eq!(key.name(), "build-42");
//! assert_eq!(key.to_string(), "ci/build-42");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Scope used for keys without a namespace.
pub const DEFAULT_SCOPE: &str = "default";

/// Maximum length of a single key segment (DNS subdomain limit).
const MAX_SEGMENT_LEN: usize = 253;

/// Identity of a cluster resource: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    namespace: Option<String>,
    name: String,
}

impl ResourceKey {
    /// Creates a namespaced key after validating both segments.
    ///
    /// # Errors
    ///
    /// Returns an error if either segment is empty or contains invalid characters.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment(&namespace, "namespace")?;
        validate_segment(&name, "name")?;
        Ok(Self {
            namespace: Some(namespace),
            name,
        })
    }

    /// Creates a cluster-scoped key.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains invalid characters.
    pub fn cluster_scoped(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment(&name, "name")?;
        Ok(Self {
            namespace: None,
            name,
        })
    }

    /// Returns the namespace, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the admission scope for this key.
    ///
    /// Namespaced keys are scoped by namespace; cluster-scoped keys share
    /// [`DEFAULT_SCOPE`].
    #[must_use]
    pub fn scope(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_SCOPE)
    }
}

fn validate_segment(segment: &str, what: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::invalid_key(segment, format!("{what} must not be empty")));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(Error::invalid_key(
            segment,
            format!("{what} exceeds {MAX_SEGMENT_LEN} characters"),
        ));
    }
    let valid = segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if !valid {
        return Err(Error::invalid_key(
            segment,
            format!("{what} must be lowercase alphanumeric, '-' or '.'"),
        ));
    }
    Ok(())
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Self::cluster_scoped(name),
            (Some(namespace), Some(name), None) => Self::new(namespace, name),
            _ => Err(Error::invalid_key(s, "expected 'namespace/name' or 'name'")),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}
