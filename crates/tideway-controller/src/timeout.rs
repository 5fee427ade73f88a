//! Enforcement of run deadlines.
//!
//! The timeout processor periodically scans `Running` runs and fails the ones
//! that outlived their deadline (the run's own `timeoutSeconds`, or the
//! configured default). The phase change is a compare-and-swap, so a run that
//! finished or was cancelled in the meantime is left alone, and only the
//! winner of the swap stops the run's execution.
//!
//! The admission slot is not released here: the workflow run handler sees
//! the terminal phase through the watch and releases it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};

use tideway_core::observability::sweep_span;

use crate::config::SharedConfig;
use crate::error::{Error, Result};
use crate::metrics::{ControllerMetrics, time_sweep};
use crate::model::{Phase, Pod, RunReason, WorkflowRun};
use crate::resource::Resource;
use crate::shipping::{EventPublisher, RunEvent};
use crate::store::{CasResult, PhaseTransition, ResourceStore, cas_phase};

const PROCESSOR: &str = "timeout";

/// Stops the execution of a run that was failed by the timeout processor.
#[async_trait]
pub trait ExecutionTerminator: Send + Sync {
    /// Stops everything still executing for `run`. Best-effort.
    async fn terminate(&self, run: &WorkflowRun) -> Result<()>;
}

/// Terminates a run by deleting the pods it owns.
pub struct PodTerminator {
    pods: Arc<dyn ResourceStore<Pod>>,
}

impl PodTerminator {
    /// Creates a terminator deleting from `pods`.
    #[must_use]
    pub fn new(pods: Arc<dyn ResourceStore<Pod>>) -> Self {
        Self { pods }
    }
}

#[async_trait]
impl ExecutionTerminator for PodTerminator {
    async fn terminate(&self, run: &WorkflowRun) -> Result<()> {
        let Some(uid) = run.metadata.uid else {
            return Ok(());
        };
        let mut failed = 0usize;
        for pod in self.pods.list().await? {
            if !pod.metadata.is_owned_by(uid) {
                continue;
            }
            let key = pod.key()?;
            match self.pods.delete(&key).await {
                Ok(_) => debug!(pod = %key, "pod deleted"),
                Err(err) => {
                    warn!(pod = %key, error = %err, "could not delete pod");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(Error::storage(format!(
                "{failed} pod(s) of {} could not be deleted",
                run.metadata.name
            )));
        }
        Ok(())
    }
}

/// Outcome of one timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Running runs inspected.
    pub checked: usize,
    /// Runs failed by this sweep.
    pub timed_out: usize,
    /// Per-run errors; the sweep continued past each.
    pub errors: usize,
}

/// Periodic sweep failing runs past their deadline.
pub struct TimeoutProcessor {
    runs: Arc<dyn ResourceStore<WorkflowRun>>,
    terminator: Arc<dyn ExecutionTerminator>,
    config: SharedConfig,
    publisher: EventPublisher,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for TimeoutProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutProcessor")
            .field("run_timeout_secs", &self.config.get().run_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl TimeoutProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        runs: Arc<dyn ResourceStore<WorkflowRun>>,
        terminator: Arc<dyn ExecutionTerminator>,
        config: SharedConfig,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            runs,
            terminator,
            config,
            publisher,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Fails every `Running` run whose deadline passed before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the runs cannot be listed. Failures on
    /// individual runs are logged and counted in the summary.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let _timer = time_sweep(PROCESSOR);
        let default_timeout = self.config.get().run_timeout();
        let mut summary = SweepSummary::default();

        for run in self.runs.list().await? {
            if run.phase() != Phase::Running {
                continue;
            }
            summary.checked += 1;
            if !run.is_timed_out(now, default_timeout) {
                continue;
            }
            match self.fail_run(&run, now).await {
                Ok(true) => summary.timed_out += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(run = %run.metadata.name, error = %err, "timeout sweep skipped run");
                    self.metrics.record_sweep_error(PROCESSOR);
                    summary.errors += 1;
                }
            }
        }

        if summary.timed_out > 0 || summary.errors > 0 {
            info!(
                checked = summary.checked,
                timed_out = summary.timed_out,
                errors = summary.errors,
                "timeout sweep finished"
            );
        }
        Ok(summary)
    }

    /// Returns true if this call moved the run to `Failed`.
    async fn fail_run(&self, run: &WorkflowRun, now: DateTime<Utc>) -> Result<bool> {
        let key = run.key()?;
        let timeout = run.timeout_or(self.config.get().run_timeout());
        let transition = PhaseTransition::new(Phase::Running, Phase::Failed, RunReason::Timeout, now)
            .with_message(format!("run exceeded its timeout of {}s", timeout.as_secs()));

        match cas_phase(self.runs.as_ref(), &key, &transition, |_| {}).await? {
            CasResult::Success => {}
            CasResult::PhaseMismatch { actual } => {
                debug!(run = %key, phase = %actual, "run left Running before timeout");
                return Ok(false);
            }
            CasResult::NotFound => return Ok(false),
        }

        info!(run = %key, timeout_secs = timeout.as_secs(), "run timed out");
        self.metrics.record_timeout();
        if let Some(failed) = self.runs.get(&key).await? {
            self.publisher.publish(RunEvent::from_run(&failed, now));
        }
        if let Err(err) = self.terminator.terminate(run).await {
            warn!(run = %key, error = %err, "could not stop execution of timed out run");
        }
        Ok(true)
    }

    /// Sweeps every `timeout_interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.get().timeout_interval_secs,
            "timeout processor started"
        );
        loop {
            let interval = self.config.get().timeout_interval();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("timeout processor shutting down");
                        break;
                    }
                }
                () = tokio::time::sleep(interval) => {
                    if let Err(err) = self.sweep_once(Utc::now()).instrument(sweep_span(PROCESSOR)).await {
                        error!(error = %err, "timeout sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::model::PodPhase;
    use crate::store::InMemoryStore;
    use chrono::Duration;

    struct Fixture {
        runs: Arc<InMemoryStore<WorkflowRun>>,
        pods: Arc<InMemoryStore<Pod>>,
        processor: TimeoutProcessor,
    }

    fn fixture() -> Fixture {
        let runs = Arc::new(InMemoryStore::new());
        let pods = Arc::new(InMemoryStore::new());
        let processor = TimeoutProcessor::new(
            runs.clone(),
            Arc::new(PodTerminator::new(pods.clone())),
            SharedConfig::new(ControllerConfig {
                run_timeout_secs: 60,
                ..ControllerConfig::default()
            }),
            EventPublisher::disabled(),
        );
        Fixture {
            runs,
            pods,
            processor,
        }
    }

    async fn started(
        runs: &InMemoryStore<WorkflowRun>,
        name: &str,
        at: DateTime<Utc>,
        timeout: Option<u64>,
    ) -> WorkflowRun {
        let mut run = WorkflowRun::new("ci", name, "backend");
        run.spec.timeout_seconds = timeout;
        run.transition_to(Phase::Running, RunReason::Admitted, None, at)
            .unwrap();
        runs.create(run).await.unwrap()
    }

    async fn phase(runs: &InMemoryStore<WorkflowRun>, run: &WorkflowRun) -> Phase {
        runs.get(&run.key().unwrap()).await.unwrap().unwrap().phase()
    }

    #[tokio::test]
    async fn fails_runs_past_their_deadline() {
        let f = fixture();
        let t0 = Utc::now();
        let run = started(&f.runs, "build-1", t0, Some(10)).await;

        let summary = f.processor.sweep_once(t0 + Duration::seconds(5)).await.unwrap();
        assert_eq!(summary.timed_out, 0);
        assert_eq!(phase(&f.runs, &run).await, Phase::Running);

        let summary = f.processor.sweep_once(t0 + Duration::seconds(15)).await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                checked: 1,
                timed_out: 1,
                errors: 0
            }
        );
        let stored = f.runs.get(&run.key().unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.phase(), Phase::Failed);
        assert_eq!(stored.status.reason, Some(RunReason::Timeout));
        assert_eq!(stored.status.completed_at, Some(t0 + Duration::seconds(15)));
    }

    #[tokio::test]
    async fn default_timeout_applies_without_run_deadline() {
        let f = fixture();
        let t0 = Utc::now();
        let run = started(&f.runs, "build-1", t0, None).await;

        f.processor.sweep_once(t0 + Duration::seconds(59)).await.unwrap();
        assert_eq!(phase(&f.runs, &run).await, Phase::Running);
        f.processor.sweep_once(t0 + Duration::seconds(61)).await.unwrap();
        assert_eq!(phase(&f.runs, &run).await, Phase::Failed);
    }

    #[tokio::test]
    async fn second_sweep_is_a_noop() {
        let f = fixture();
        let t0 = Utc::now();
        let run = started(&f.runs, "build-1", t0, Some(10)).await;
        let later = t0 + Duration::seconds(30);

        f.processor.sweep_once(later).await.unwrap();
        let version = f
            .runs
            .get(&run.key().unwrap())
            .await
            .unwrap()
            .unwrap()
            .metadata
            .resource_version;

        let summary = f.processor.sweep_once(later).await.unwrap();
        assert_eq!(summary, SweepSummary::default());
        let stored = f.runs.get(&run.key().unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.metadata.resource_version, version);
    }

    #[tokio::test]
    async fn pending_and_finished_runs_are_ignored() {
        let f = fixture();
        let t0 = Utc::now();
        f.runs
            .create(WorkflowRun::new("ci", "queued", "backend"))
            .await
            .unwrap();
        let mut done = WorkflowRun::new("ci", "done", "backend");
        done.transition_to(Phase::Running, RunReason::Admitted, None, t0)
            .unwrap();
        done.transition_to(Phase::Succeeded, RunReason::Completed, None, t0)
            .unwrap();
        f.runs.create(done).await.unwrap();

        let summary = f.processor.sweep_once(t0 + Duration::days(1)).await.unwrap();
        assert_eq!(summary.checked, 0);
    }

    #[tokio::test]
    async fn timed_out_run_pods_are_deleted() {
        let f = fixture();
        let t0 = Utc::now();
        let run = started(&f.runs, "build-1", t0, Some(10)).await;
        let other = started(&f.runs, "build-2", t0, Some(3600)).await;
        f.pods
            .create(Pod::for_stage(&run, "compile").with_phase(PodPhase::Running))
            .await
            .unwrap();
        f.pods
            .create(Pod::for_stage(&other, "compile").with_phase(PodPhase::Running))
            .await
            .unwrap();

        f.processor.sweep_once(t0 + Duration::seconds(15)).await.unwrap();

        let remaining = f.pods.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.name, "build-2-compile");
    }

    #[tokio::test]
    async fn terminator_failure_does_not_undo_timeout() {
        let f = fixture();
        let t0 = Utc::now();
        let run = started(&f.runs, "build-1", t0, Some(10)).await;
        let pod = f
            .pods
            .create(Pod::for_stage(&run, "compile"))
            .await
            .unwrap();
        f.pods.fail_deletes_of(pod.key().unwrap()).unwrap();

        let summary = f.processor.sweep_once(t0 + Duration::seconds(15)).await.unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(phase(&f.runs, &run).await, Phase::Failed);
    }

    #[tokio::test]
    async fn store_failure_is_counted_and_sweep_continues() {
        let f = fixture();
        let t0 = Utc::now();
        started(&f.runs, "build-1", t0, Some(10)).await;
        started(&f.runs, "build-2", t0, Some(10)).await;
        f.runs.fail_next_updates(1).unwrap();

        let summary = f.processor.sweep_once(t0 + Duration::seconds(15)).await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let f = fixture();
        let processor = Arc::new(f.processor);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(processor.run(rx));

        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
