//! Workflow run resource and its phase state machine.
//!
//! A workflow run is one execution of a pipeline. Its phase only ever moves
//! forward:
//!
//! ```text
//!   Pending ──admit──▶ Running ──▶ Succeeded | Failed | Cancelled
//!      │
//!      └──cancel──▶ Cancelled
//! ```
//!
//! Entering `Running` stamps `started_at`; entering a terminal phase stamps
//! `completed_at`. Nothing leaves a terminal phase.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::pod::PodPhase;
use crate::resource::{ObjectMeta, Resource};

/// Workflow run phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Created, waiting for an admission slot.
    #[default]
    Pending,
    /// Admitted and executing.
    Running,
    /// All stages completed successfully.
    Succeeded,
    /// A stage failed or the run exceeded its deadline.
    Failed,
    /// Cancelled by a user or the system.
    Cancelled,
}

impl Phase {
    /// Returns true if this is a terminal phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed | Self::Cancelled),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns the phase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run entered its current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunReason {
    /// Admission granted a running slot.
    Admitted,
    /// Every declared stage succeeded.
    Completed,
    /// A stage pod failed.
    StageFailed,
    /// The run exceeded its deadline.
    Timeout,
    /// A user or the system cancelled the run.
    Cancelled,
}

impl std::fmt::Display for RunReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admitted => write!(f, "Admitted"),
            Self::Completed => write!(f, "Completed"),
            Self::StageFailed => write!(f, "StageFailed"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Declared intent of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunSpec {
    /// Name of the pipeline this run executes.
    pub pipeline: String,
    /// Per-run deadline; the configured default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Stages the run executes, one pod each.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<String>,
}

/// Projected status of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    /// Name of the pod executing the stage.
    pub pod_name: String,
    /// Last observed pod phase.
    pub phase: PodPhase,
}

/// Observed state of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStatus {
    /// Current phase.
    pub phase: Phase,
    /// Reason for the last phase change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RunReason>,
    /// Human-readable detail for the last phase change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the run entered `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run entered a terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-stage projection of pod state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageStatus>,
}

/// One execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Declared intent.
    pub spec: WorkflowRunSpec,
    /// Observed state.
    #[serde(default)]
    pub status: WorkflowRunStatus,
}

impl WorkflowRun {
    /// Creates a pending run of `pipeline`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: WorkflowRunSpec {
                pipeline: pipeline.into(),
                timeout_seconds: None,
                stages: Vec::new(),
            },
            status: WorkflowRunStatus::default(),
        }
    }

    /// Sets a per-run deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout_seconds = Some(timeout.as_secs());
        self
    }

    /// Declares the stages this run executes.
    #[must_use]
    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.stages = stages.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    /// Returns the run's deadline, falling back to `default`.
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.spec.timeout_seconds.map_or(default, Duration::from_secs)
    }

    /// Returns true if the run is `Running` and has exceeded its deadline at `now`.
    #[must_use]
    pub fn is_timed_out(&self, now: DateTime<Utc>, default_timeout: Duration) -> bool {
        if self.status.phase != Phase::Running {
            return false;
        }
        let Some(started_at) = self.status.started_at else {
            return false;
        };
        let Ok(timeout) = chrono::Duration::from_std(self.timeout_or(default_timeout)) else {
            return false;
        };
        now - started_at > timeout
    }

    /// Checks required fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidObject`] if the key is malformed, the pipeline
    /// reference is missing or a declared timeout is zero.
    pub fn validate(&self) -> Result<()> {
        let key = self.metadata.key()?;
        let invalid = |message: &str| Error::InvalidObject {
            kind: Self::KIND,
            key: key.clone(),
            message: message.to_string(),
        };
        if self.spec.pipeline.trim().is_empty() {
            return Err(invalid("spec.pipeline is required"));
        }
        if self.spec.timeout_seconds == Some(0) {
            return Err(invalid("spec.timeoutSeconds must be positive"));
        }
        Ok(())
    }

    /// Moves the run to `target`, stamping timestamps as required.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed by the phase machine.
    pub fn transition_to(
        &mut self,
        target: Phase,
        reason: RunReason,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = self.status.phase;
        if !current.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: target.to_string(),
                reason: if current.is_terminal() {
                    "terminal phases are final".to_string()
                } else {
                    format!("{current} cannot move to {target}")
                },
            });
        }

        if target == Phase::Running {
            self.status.started_at = Some(now);
        }
        if target.is_terminal() && self.status.completed_at.is_none() {
            self.status.completed_at = Some(now);
        }
        self.status.phase = target;
        self.status.reason = Some(reason);
        self.status.message = message;
        Ok(())
    }
}

impl Resource for WorkflowRun {
    const KIND: &'static str = "WorkflowRun";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
