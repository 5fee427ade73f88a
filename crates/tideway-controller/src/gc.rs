//! Garbage collection of finished workflow runs.
//!
//! A terminal run is collected when either retention rule selects it:
//!
//! - **Age**: it completed more than `retention_age` ago
//! - **Count**: it falls beyond the newest `retention_count` terminal runs of
//!   its pipeline (per namespace)
//!
//! Collection deletes the pods and config maps owned by the run first and the
//! run record last. If any owned object cannot be deleted the record is kept,
//! so the next sweep finds the run again and retries.
//!
//! Sub-resources whose owning run no longer exists are collected once they
//! are older than `orphan_grace`.
//!
//! Non-terminal runs are never touched.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tracing::{Instrument, debug, error, info, warn};

use tideway_core::ObjectUid;
use tideway_core::observability::sweep_span;

use crate::config::{ControllerConfig, SharedConfig};
use crate::error::Result;
use crate::metrics::{ControllerMetrics, time_sweep};
use crate::model::{ConfigMap, Pod, WorkflowRun};
use crate::resource::{ObjectMeta, Resource};
use crate::store::ResourceStore;

const PROCESSOR: &str = "gc";

/// Outcome of one GC sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    /// Run records deleted.
    pub runs_deleted: usize,
    /// Owned pods deleted, orphans included.
    pub pods_deleted: usize,
    /// Owned config maps deleted, orphans included.
    pub config_maps_deleted: usize,
    /// Sub-resources deleted because their run was gone.
    pub orphans_deleted: usize,
    /// Runs kept because an owned object could not be deleted.
    pub runs_kept: usize,
    /// Failed deletions.
    pub errors: usize,
}

/// Selects the terminal runs the retention rules collect, oldest first.
///
/// Runs without a completion time sort by creation time and are never
/// selected by age.
#[must_use]
pub fn select_for_collection<'a>(
    runs: &'a [WorkflowRun],
    config: &ControllerConfig,
    now: DateTime<Utc>,
) -> Vec<&'a WorkflowRun> {
    let mut by_pipeline: BTreeMap<(Option<&str>, &str), Vec<&WorkflowRun>> = BTreeMap::new();
    for run in runs.iter().filter(|run| run.phase().is_terminal()) {
        by_pipeline
            .entry((run.metadata.namespace.as_deref(), run.spec.pipeline.as_str()))
            .or_default()
            .push(run);
    }

    let max_age = config
        .retention_age()
        .and_then(|age| chrono::Duration::from_std(age).ok());
    let mut selected = Vec::new();
    for mut group in by_pipeline.into_values() {
        group.sort_by_key(|run| std::cmp::Reverse(finished_at(run)));
        for (rank, run) in group.into_iter().enumerate() {
            let over_count = config.retention_count.is_some_and(|keep| rank >= keep);
            let over_age = match (max_age, run.status.completed_at) {
                (Some(max_age), Some(completed_at)) => now - completed_at > max_age,
                _ => false,
            };
            if over_count || over_age {
                selected.push(run);
            }
        }
    }
    selected.sort_by_key(|run| finished_at(run));
    selected
}

fn finished_at(run: &WorkflowRun) -> Option<DateTime<Utc>> {
    run.status.completed_at.or(run.metadata.creation_timestamp)
}

fn older_than(meta: &ObjectMeta, grace: Duration, now: DateTime<Utc>) -> bool {
    meta.creation_timestamp
        .and_then(|created| (now - created).to_std().ok())
        .is_some_and(|age| age > grace)
}

/// Periodic, on-demand collector of finished runs and their sub-resources.
pub struct GcProcessor {
    runs: Arc<dyn ResourceStore<WorkflowRun>>,
    pods: Arc<dyn ResourceStore<Pod>>,
    config_maps: Arc<dyn ResourceStore<ConfigMap>>,
    config: SharedConfig,
    trigger: Notify,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for GcProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config.get();
        f.debug_struct("GcProcessor")
            .field("enabled", &config.gc_enabled)
            .field("retention_count", &config.retention_count)
            .field("retention_age_secs", &config.retention_age_secs)
            .finish_non_exhaustive()
    }
}

impl GcProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        runs: Arc<dyn ResourceStore<WorkflowRun>>,
        pods: Arc<dyn ResourceStore<Pod>>,
        config_maps: Arc<dyn ResourceStore<ConfigMap>>,
        config: SharedConfig,
    ) -> Self {
        Self {
            runs,
            pods,
            config_maps,
            config,
            trigger: Notify::new(),
            metrics: ControllerMetrics::new(),
        }
    }

    /// Requests a sweep ahead of the next interval.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Runs one collection pass at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error only if a listing fails. Failed deletions are logged
    /// and counted in the summary.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<GcSummary> {
        let config = self.config.get();
        if !config.gc_enabled {
            debug!("garbage collection disabled, skipping sweep");
            return Ok(GcSummary::default());
        }
        let _timer = time_sweep(PROCESSOR);

        let runs = self.runs.list().await?;
        let pods = self.pods.list().await?;
        let config_maps = self.config_maps.list().await?;
        let mut summary = GcSummary::default();

        for run in select_for_collection(&runs, &config, now) {
            self.collect_run(run, &pods, &config_maps, &mut summary).await;
        }

        let live: HashSet<ObjectUid> = runs.iter().filter_map(|run| run.metadata.uid).collect();
        self.collect_orphans(&pods, &config_maps, &live, config.orphan_grace(), now, &mut summary)
            .await;

        self.metrics.record_gc_deletions(WorkflowRun::KIND, summary.runs_deleted);
        self.metrics.record_gc_deletions(Pod::KIND, summary.pods_deleted);
        self.metrics
            .record_gc_deletions(ConfigMap::KIND, summary.config_maps_deleted);
        if summary != GcSummary::default() {
            info!(
                runs_deleted = summary.runs_deleted,
                pods_deleted = summary.pods_deleted,
                config_maps_deleted = summary.config_maps_deleted,
                orphans_deleted = summary.orphans_deleted,
                runs_kept = summary.runs_kept,
                errors = summary.errors,
                "garbage collection finished"
            );
        }
        Ok(summary)
    }

    async fn collect_run(
        &self,
        run: &WorkflowRun,
        pods: &[Pod],
        config_maps: &[ConfigMap],
        summary: &mut GcSummary,
    ) {
        let Ok(run_key) = run.key() else {
            summary.errors += 1;
            return;
        };
        let mut complete = true;
        if let Some(uid) = run.metadata.uid {
            for pod in pods.iter().filter(|pod| pod.metadata.is_owned_by(uid)) {
                if self.delete(self.pods.as_ref(), pod, summary).await {
                    summary.pods_deleted += 1;
                } else {
                    complete = false;
                }
            }
            for config_map in config_maps.iter().filter(|cm| cm.metadata.is_owned_by(uid)) {
                if self.delete(self.config_maps.as_ref(), config_map, summary).await {
                    summary.config_maps_deleted += 1;
                } else {
                    complete = false;
                }
            }
        }

        if !complete {
            warn!(run = %run_key, "keeping run until its sub-resources are deleted");
            summary.runs_kept += 1;
            return;
        }
        if self.delete(self.runs.as_ref(), run, summary).await {
            debug!(run = %run_key, phase = %run.phase(), "run collected");
            summary.runs_deleted += 1;
        }
    }

    async fn collect_orphans(
        &self,
        pods: &[Pod],
        config_maps: &[ConfigMap],
        live: &HashSet<ObjectUid>,
        grace: Duration,
        now: DateTime<Utc>,
        summary: &mut GcSummary,
    ) {
        let orphaned = |meta: &ObjectMeta| {
            meta.owner_of_kind(WorkflowRun::KIND)
                .is_some_and(|owner| !live.contains(&owner.uid))
                && older_than(meta, grace, now)
        };

        for pod in pods.iter().filter(|pod| orphaned(&pod.metadata)) {
            if self.delete(self.pods.as_ref(), pod, summary).await {
                summary.pods_deleted += 1;
                summary.orphans_deleted += 1;
            }
        }
        for config_map in config_maps.iter().filter(|cm| orphaned(&cm.metadata)) {
            if self.delete(self.config_maps.as_ref(), config_map, summary).await {
                summary.config_maps_deleted += 1;
                summary.orphans_deleted += 1;
            }
        }
    }

    /// Deletes one object; returns true once it is gone.
    async fn delete<T: Resource>(
        &self,
        store: &dyn ResourceStore<T>,
        object: &T,
        summary: &mut GcSummary,
    ) -> bool {
        let key = match object.key() {
            Ok(key) => key,
            Err(err) => {
                warn!(kind = T::KIND, name = %object.meta().name, error = %err, "cannot collect object");
                summary.errors += 1;
                return false;
            }
        };
        match store.delete(&key).await {
            Ok(_) => true,
            Err(err) => {
                warn!(kind = T::KIND, key = %key, error = %err, "delete failed");
                self.metrics.record_sweep_error(PROCESSOR);
                summary.errors += 1;
                false
            }
        }
    }

    /// Sweeps every `gc_interval`, or when triggered, until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.get().gc_interval_secs,
            "garbage collector started"
        );
        loop {
            let interval = self.config.get().gc_interval();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("garbage collector shutting down");
                        break;
                    }
                    continue;
                }
                () = tokio::time::sleep(interval) => {}
                () = self.trigger.notified() => debug!("garbage collection triggered"),
            }
            if let Err(err) = self.sweep_once(Utc::now()).instrument(sweep_span(PROCESSOR)).await {
                error!(error = %err, "garbage collection sweep failed");
            }
        }
    }
}
