//! Config maps: run inputs and the controller's own configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::workflow_run::WorkflowRun;
use crate::resource::{ObjectMeta, OwnerReference, Resource};

/// String key/value data object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Data entries.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigMap {
    /// Creates an empty config map.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            data: BTreeMap::new(),
        }
    }

    /// Creates an empty config map owned by `run`.
    #[must_use]
    pub fn owned_by(run: &WorkflowRun, suffix: &str) -> Self {
        let namespace = run.metadata.namespace.clone().unwrap_or_default();
        let mut map = Self::new(namespace, format!("{}-{suffix}", run.metadata.name));
        if let Some(owner) = run.owner_reference() {
            map.metadata = map.metadata.with_owner(owner);
        }
        map
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Returns the data entry for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Returns the owner reference to a run, if any.
    #[must_use]
    pub fn run_owner(&self) -> Option<&OwnerReference> {
        self.metadata.owner_of_kind(WorkflowRun::KIND)
    }
}

impl Resource for ConfigMap {
    const KIND: &'static str = "ConfigMap";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideway_core::ObjectUid;

    #[test]
    fn owned_map_points_at_run() {
        let mut run = WorkflowRun::new("ci", "build-1", "backend");
        run.metadata.uid = Some(ObjectUid::generate());
        let map = ConfigMap::owned_by(&run, "inputs").with_entry("ref", "main");
        assert_eq!(map.metadata.name, "build-1-inputs");
        assert_eq!(map.get("ref"), Some("main"));
        assert_eq!(map.run_owner().map(|o| o.uid), run.metadata.uid);
    }
}
