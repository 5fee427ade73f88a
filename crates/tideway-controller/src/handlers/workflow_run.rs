//! Workflow run reconciliation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::admission::{Admission, AdmissionController};
use crate::controller::Handler;
use crate::error::Result;
use crate::model::{Phase, WorkflowRun};
use crate::resource::Resource;
use crate::store::{ResourceStore, update_with_retry};

/// Drives runs through admission and returns their slots when they finish.
pub struct WorkflowRunHandler {
    admission: Arc<AdmissionController>,
    store: Arc<dyn ResourceStore<WorkflowRun>>,
}

impl std::fmt::Debug for WorkflowRunHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunHandler")
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

impl WorkflowRunHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(admission: Arc<AdmissionController>, store: Arc<dyn ResourceStore<WorkflowRun>>) -> Self {
        Self { admission, store }
    }

    /// Converges admission bookkeeping with the run's observed phase.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for malformed runs and a transient one if
    /// the store write fails.
    pub async fn reconcile(&self, run: &WorkflowRun) -> Result<()> {
        run.validate()?;
        let key = run.key()?;

        match run.phase() {
            Phase::Pending => {
                let decision = self.admission.try_admit(run).await?;
                match decision {
                    Admission::Queued { position } => {
                        info!(run = %key, position, "run waiting for a slot");
                    }
                    other => debug!(run = %key, decision = other.as_str(), "admission decided"),
                }
            }
            Phase::Running => {
                if run.status.started_at.is_none() {
                    let now = Utc::now();
                    update_with_retry(self.store.as_ref(), &key, |stored: &mut WorkflowRun| {
                        if stored.phase() == Phase::Running && stored.status.started_at.is_none() {
                            stored.status.started_at = Some(now);
                            true
                        } else {
                            false
                        }
                    })
                    .await?;
                    info!(run = %key, "running run had no start time, deadline starts now");
                }
                if self.admission.track_running(&key, run.metadata.uid) {
                    info!(run = %key, "tracking running run");
                }
            }
            Phase::Succeeded | Phase::Failed | Phase::Cancelled => {
                if run.status.completed_at.is_none() {
                    let now = Utc::now();
                    update_with_retry(self.store.as_ref(), &key, |stored: &mut WorkflowRun| {
                        if stored.phase().is_terminal() && stored.status.completed_at.is_none() {
                            stored.status.completed_at = Some(now);
                            true
                        } else {
                            false
                        }
                    })
                    .await?;
                }
                self.admission.release(&key).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<WorkflowRun> for WorkflowRunHandler {
    async fn object_created(&self, run: &WorkflowRun) -> Result<()> {
        self.reconcile(run).await
    }

    async fn object_updated(&self, run: &WorkflowRun) -> Result<()> {
        self.reconcile(run).await
    }

    async fn object_deleted(&self, run: &WorkflowRun) -> Result<()> {
        let key = run.key()?;
        debug!(run = %key, phase = %run.phase(), "run deleted");
        self.admission.forget(&key, run.metadata.uid).await;
        Ok(())
    }
}
