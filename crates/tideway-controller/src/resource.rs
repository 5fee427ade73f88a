//! Object metadata shared by every stored resource kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tideway_core::{ObjectUid, ResourceKey};

use crate::error::Result;

/// Link from a sub-resource to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owner (e.g. `WorkflowRun`).
    pub kind: String,
    /// Name of the owner.
    pub name: String,
    /// UID of the owner.
    pub uid: ObjectUid,
}

/// Metadata carried by every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within the namespace.
    pub name: String,
    /// Namespace, `None` for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Store-assigned identity, set on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<ObjectUid>,
    /// Store version for optimistic concurrency; 0 before the first write.
    #[serde(default)]
    pub resource_version: u64,
    /// Free-form labels used by watch selectors.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Store-assigned creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Owners whose deletion cascades to this object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Creates metadata for a namespaced object.
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            uid: None,
            resource_version: 0,
            labels: BTreeMap::new(),
            creation_timestamp: None,
            owner_references: Vec::new(),
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an owner reference.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }

    /// Returns the resource key for this metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or namespace is not a valid key segment.
    pub fn key(&self) -> Result<ResourceKey> {
        let key = match &self.namespace {
            Some(namespace) => ResourceKey::new(namespace.clone(), self.name.clone())?,
            None => ResourceKey::cluster_scoped(self.name.clone())?,
        };
        Ok(key)
    }

    /// Returns the owner reference of the given kind, if any.
    #[must_use]
    pub fn owner_of_kind(&self, kind: &str) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.kind == kind)
    }

    /// Returns true if `uid` is among the object's owners.
    #[must_use]
    pub fn is_owned_by(&self, uid: ObjectUid) -> bool {
        self.owner_references.iter().any(|o| o.uid == uid)
    }

    /// Returns true if every `selector` label is present with the same value.
    #[must_use]
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// A kind of object the controller can store, watch and reconcile.
pub trait Resource: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Kind name used in logs, errors and owner references.
    const KIND: &'static str;

    /// Returns the object metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Returns mutable object metadata.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Returns the resource key.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata does not form a valid key.
    fn key(&self) -> Result<ResourceKey> {
        self.meta().key()
    }

    /// Returns an owner reference pointing at this object.
    ///
    /// `None` until the store has assigned a UID.
    fn owner_reference(&self) -> Option<OwnerReference> {
        self.meta().uid.map(|uid| OwnerReference {
            kind: Self::KIND.to_string(),
            name: self.meta().name.clone(),
            uid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_key_includes_namespace() {
        let meta = ObjectMeta::namespaced("ci", "build-1");
        assert_eq!(meta.key().unwrap().to_string(), "ci/build-1");
    }

    #[test]
    fn invalid_name_fails_key() {
        let meta = ObjectMeta::namespaced("ci", "");
        assert!(meta.key().is_err());
    }

    #[test]
    fn label_selector_matching() {
        let meta = ObjectMeta::namespaced("ci", "pod-a")
            .with_label("tideway.dev/workflow-run", "build-1")
            .with_label("tideway.dev/stage", "compile");

        let mut selector = BTreeMap::new();
        assert!(meta.matches_labels(&selector));
        selector.insert("tideway.dev/stage".to_string(), "compile".to_string());
        assert!(meta.matches_labels(&selector));
        selector.insert("tideway.dev/stage".to_string(), "test".to_string());
        assert!(!meta.matches_labels(&selector));
    }

    #[test]
    fn owner_lookup_by_kind() {
        let uid = ObjectUid::generate();
        let meta = ObjectMeta::namespaced("ci", "pod-a").with_owner(OwnerReference {
            kind: "WorkflowRun".into(),
            name: "build-1".into(),
            uid,
        });
        assert_eq!(meta.owner_of_kind("WorkflowRun").map(|o| o.uid), Some(uid));
        assert!(meta.owner_of_kind("Pipeline").is_none());
    }
}
