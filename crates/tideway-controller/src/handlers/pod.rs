//! Projection of stage pods onto their owning workflow run.
//!
//! Each pod executes one stage and carries an owner reference to its run.
//! The handler copies the pod phase into `status.stages[stage]` and derives
//! the run outcome from the projected stages:
//!
//! - any stage `Failed` fails a `Running` run with [`RunReason::StageFailed`]
//! - every declared stage `Succeeded` completes a `Running` run
//!
//! Both outcomes are phase-conditioned, so a run that already timed out or
//! was cancelled is left alone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use tideway_core::ResourceKey;

use crate::controller::Handler;
use crate::error::Result;
use crate::model::{Phase, Pod, PodPhase, RunReason, StageStatus, WorkflowRun};
use crate::resource::Resource;
use crate::shipping::{EventPublisher, RunEvent};
use crate::store::{CasResult, PhaseTransition, ResourceStore, cas_phase, update_with_retry};

/// Keeps run stage status in line with the pods executing the stages.
pub struct PodHandler {
    runs: Arc<dyn ResourceStore<WorkflowRun>>,
    publisher: EventPublisher,
}

impl std::fmt::Debug for PodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodHandler").finish_non_exhaustive()
    }
}

/// Run outcome implied by its projected stages.
fn outcome(run: &WorkflowRun) -> Option<(Phase, RunReason, String)> {
    if let Some((stage, _)) = run
        .status
        .stages
        .iter()
        .find(|(_, status)| status.phase == PodPhase::Failed)
    {
        return Some((Phase::Failed, RunReason::StageFailed, format!("stage {stage} failed")));
    }
    let all_succeeded = !run.spec.stages.is_empty()
        && run.spec.stages.iter().all(|stage| {
            run.status
                .stages
                .get(stage)
                .is_some_and(|status| status.phase == PodPhase::Succeeded)
        });
    all_succeeded.then(|| {
        (
            Phase::Succeeded,
            RunReason::Completed,
            "all stages succeeded".to_string(),
        )
    })
}

impl PodHandler {
    /// Creates a handler writing to the run store.
    #[must_use]
    pub fn new(runs: Arc<dyn ResourceStore<WorkflowRun>>, publisher: EventPublisher) -> Self {
        Self { runs, publisher }
    }

    async fn project(&self, pod: &Pod) -> Result<()> {
        let (Some(owner), Some(stage)) = (pod.run_owner(), pod.stage()) else {
            debug!(pod = %pod.metadata.name, "pod has no run owner or stage, ignoring");
            return Ok(());
        };
        let run_key = match &pod.metadata.namespace {
            Some(namespace) => ResourceKey::new(namespace.clone(), owner.name.clone())?,
            None => ResourceKey::cluster_scoped(owner.name.clone())?,
        };
        let observed = StageStatus {
            pod_name: pod.metadata.name.clone(),
            phase: pod.status.phase,
        };
        let owner_uid = owner.uid;

        let updated = update_with_retry(self.runs.as_ref(), &run_key, |run: &mut WorkflowRun| {
            if run.metadata.uid != Some(owner_uid) || run.phase().is_terminal() {
                return false;
            }
            if run.status.stages.get(stage) == Some(&observed) {
                return false;
            }
            run.status.stages.insert(stage.to_string(), observed.clone());
            true
        })
        .await?;

        let Some(run) = updated else {
            debug!(run = %run_key, pod = %pod.metadata.name, "owning run is gone, ignoring pod");
            return Ok(());
        };
        if run.metadata.uid != Some(owner_uid) {
            debug!(run = %run_key, "pod belongs to an earlier run with the same name");
            return Ok(());
        }
        if run.phase() != Phase::Running {
            return Ok(());
        }
        let Some((target, reason, message)) = outcome(&run) else {
            return Ok(());
        };

        let transition =
            PhaseTransition::new(Phase::Running, target, reason, Utc::now()).with_message(message);
        match cas_phase(self.runs.as_ref(), &run_key, &transition, |_| {}).await? {
            CasResult::Success => {
                info!(run = %run_key, phase = %target, reason = %reason, "run finished");
                if let Some(finished) = self.runs.get(&run_key).await? {
                    self.publisher
                        .publish(RunEvent::from_run(&finished, transition.at));
                }
            }
            CasResult::PhaseMismatch { actual } => {
                debug!(run = %run_key, phase = %actual, "run left Running before stage outcome");
            }
            CasResult::NotFound => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<Pod> for PodHandler {
    async fn object_created(&self, pod: &Pod) -> Result<()> {
        self.project(pod).await
    }

    async fn object_updated(&self, pod: &Pod) -> Result<()> {
        self.project(pod).await
    }

    async fn object_deleted(&self, pod: &Pod) -> Result<()> {
        debug!(pod = %pod.metadata.name, phase = ?pod.status.phase, "pod deleted");
        Ok(())
    }
}
