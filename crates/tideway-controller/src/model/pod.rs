//! Stage pods owned by workflow runs.

use serde::{Deserialize, Serialize};

use crate::model::workflow_run::WorkflowRun;
use crate::resource::{ObjectMeta, OwnerReference, Resource};

/// Label marking pods created for workflow stages.
pub const LABEL_MANAGED_BY: &str = "tideway.dev/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on workflow pods.
pub const MANAGED_BY_VALUE: &str = "tideway";

/// Label carrying the owning run's name.
pub const LABEL_WORKFLOW_RUN: &str = "tideway.dev/workflow-run";

/// Label carrying the stage a pod executes.
pub const LABEL_STAGE: &str = "tideway.dev/stage";

/// Pod lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not yet running.
    #[default]
    Pending,
    /// At least one container is running.
    Running,
    /// All containers exited successfully.
    Succeeded,
    /// At least one container exited with failure.
    Failed,
    /// State could not be obtained.
    Unknown,
}

impl PodPhase {
    /// Returns true if the pod has finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Observed pod state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    /// Current phase.
    pub phase: PodPhase,
    /// Detail reported by the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Execution unit of one workflow stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Observed state.
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Creates the pod for `stage` of `run`, labelled and owned by the run.
    ///
    /// The owner reference is only attached once the run has a UID.
    #[must_use]
    pub fn for_stage(run: &WorkflowRun, stage: &str) -> Self {
        let namespace = run.metadata.namespace.clone().unwrap_or_default();
        let mut metadata = ObjectMeta::namespaced(namespace, format!("{}-{stage}", run.metadata.name))
            .with_label(LABEL_MANAGED_BY, MANAGED_BY_VALUE)
            .with_label(LABEL_WORKFLOW_RUN, run.metadata.name.clone())
            .with_label(LABEL_STAGE, stage);
        if let Some(owner) = run.owner_reference() {
            metadata = metadata.with_owner(owner);
        }
        Self {
            metadata,
            status: PodStatus::default(),
        }
    }

    /// Sets the pod phase.
    #[must_use]
    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.status.phase = phase;
        self
    }

    /// Returns the stage this pod executes.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        self.metadata.labels.get(LABEL_STAGE).map(String::as_str)
    }

    /// Returns the owner reference to the run, if any.
    #[must_use]
    pub fn run_owner(&self) -> Option<&OwnerReference> {
        self.metadata.owner_of_kind(WorkflowRun::KIND)
    }
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
