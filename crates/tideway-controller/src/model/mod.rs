//! Resource kinds reconciled by the controller.

pub mod config_map;
pub mod pod;
pub mod workflow_run;

pub use config_map::ConfigMap;
pub use pod::{Pod, PodPhase, PodStatus};
pub use workflow_run::{Phase, RunReason, StageStatus, WorkflowRun, WorkflowRunSpec, WorkflowRunStatus};
