//! Property-based tests for admission and garbage collection invariants.
//!
//! These tests use proptest to drive random operation sequences and run
//! populations, checking the invariants after every step.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use tokio_test::block_on;

use tideway_controller::admission::AdmissionController;
use tideway_controller::config::{ControllerConfig, SharedConfig};
use tideway_controller::gc::select_for_collection;
use tideway_controller::model::{Phase, RunReason, WorkflowRun};
use tideway_controller::resource::Resource;
use tideway_controller::shipping::EventPublisher;
use tideway_controller::store::{InMemoryStore, ResourceStore};
use tideway_core::ResourceKey;

const SCOPE: &str = "ci";

/// One user or executor action against a run slot.
#[derive(Debug, Clone, Copy)]
enum Op {
    Create(usize),
    Finish(usize),
    Delete(usize),
    /// Delete and create again under the same name, with no delete notification.
    Recreate(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..8).prop_map(Op::Create),
        2 => (0usize..8).prop_map(Op::Finish),
        1 => (0usize..8).prop_map(Op::Delete),
        1 => (0usize..8).prop_map(Op::Recreate),
    ]
}

fn key(index: usize) -> ResourceKey {
    ResourceKey::new(SCOPE, format!("run-{index}")).unwrap()
}

async fn apply(store: &InMemoryStore<WorkflowRun>, admission: &AdmissionController, op: Op) {
    match op {
        Op::Create(index) => {
            if store.get(&key(index)).await.unwrap().is_some() {
                return;
            }
            let run = store
                .create(WorkflowRun::new(SCOPE, format!("run-{index}"), "backend"))
                .await
                .unwrap();
            admission.try_admit(&run).await.unwrap();
        }
        Op::Finish(index) => {
            let Some(mut run) = store.get(&key(index)).await.unwrap() else {
                return;
            };
            if run.phase() != Phase::Running {
                return;
            }
            run.transition_to(Phase::Succeeded, RunReason::Completed, None, Utc::now())
                .unwrap();
            store.update(run).await.unwrap();
            admission.release(&key(index)).await;
        }
        Op::Delete(index) => {
            let Some(run) = store.get(&key(index)).await.unwrap() else {
                return;
            };
            store.delete(&key(index)).await.unwrap();
            admission.forget(&key(index), run.metadata.uid).await;
        }
        Op::Recreate(index) => {
            store.delete(&key(index)).await.unwrap();
            let run = store
                .create(WorkflowRun::new(SCOPE, format!("run-{index}"), "backend"))
                .await
                .unwrap();
            admission.try_admit(&run).await.unwrap();
        }
    }
}

async fn stored_running(store: &InMemoryStore<WorkflowRun>) -> usize {
    store
        .list()
        .await
        .unwrap()
        .iter()
        .filter(|run| run.phase() == Phase::Running)
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The number of running runs never exceeds the limit, and nobody waits
    /// while a slot is free.
    #[test]
    fn admission_never_exceeds_the_limit(
        limit in 1usize..4,
        ops in prop::collection::vec(arb_op(), 1..40),
    ) {
        block_on(async {
            let store = Arc::new(InMemoryStore::<WorkflowRun>::new());
            let admission = AdmissionController::new(
                store.clone(),
                SharedConfig::new(ControllerConfig {
                    max_concurrent_runs: limit,
                    ..ControllerConfig::default()
                }),
                EventPublisher::disabled(),
            );

            for op in ops {
                apply(&store, &admission, op).await;

                let running = stored_running(&store).await;
                assert!(running <= limit, "{running} running with limit {limit} after {op:?}");
                assert_eq!(admission.running_count(SCOPE), running);
                if admission.pending_count(SCOPE) > 0 {
                    assert_eq!(running, limit, "run waits while a slot is free after {op:?}");
                }
            }
        });
    }

    /// Waiting runs are admitted in creation order.
    #[test]
    fn pending_runs_are_admitted_in_order(waiting in 1usize..6) {
        block_on(async {
            let store = Arc::new(InMemoryStore::<WorkflowRun>::new());
            let admission = AdmissionController::new(
                store.clone(),
                SharedConfig::new(ControllerConfig {
                    max_concurrent_runs: 1,
                    ..ControllerConfig::default()
                }),
                EventPublisher::disabled(),
            );

            for index in 0..=waiting {
                apply(&store, &admission, Op::Create(index)).await;
            }
            for index in 0..waiting {
                assert!(admission.is_running(&key(index)));
                assert_eq!(admission.position(&key(index + 1)), Some(1));
                apply(&store, &admission, Op::Finish(index)).await;
            }
            assert!(admission.is_running(&key(waiting)));
        });
    }
}

#[derive(Debug, Clone)]
struct RunShape {
    pipeline: &'static str,
    phase: Phase,
    age_hours: i64,
}

fn arb_run_shape() -> impl Strategy<Value = RunShape> {
    (
        prop::sample::select(vec!["backend", "frontend"]),
        prop::sample::select(vec![
            Phase::Pending,
            Phase::Running,
            Phase::Succeeded,
            Phase::Failed,
            Phase::Cancelled,
        ]),
        0i64..200,
    )
        .prop_map(|(pipeline, phase, age_hours)| RunShape {
            pipeline,
            phase,
            age_hours,
        })
}

fn materialize(index: usize, shape: &RunShape, now: chrono::DateTime<Utc>) -> WorkflowRun {
    let at = now - TimeDelta::hours(shape.age_hours);
    let mut run = WorkflowRun::new(SCOPE, format!("run-{index}"), shape.pipeline);
    run.metadata.creation_timestamp = Some(at);
    let reason = match shape.phase {
        Phase::Pending => return run,
        Phase::Running | Phase::Succeeded => RunReason::Completed,
        Phase::Failed => RunReason::StageFailed,
        Phase::Cancelled => RunReason::Cancelled,
    };
    if shape.phase != Phase::Cancelled {
        run.transition_to(Phase::Running, RunReason::Admitted, None, at)
            .unwrap();
    }
    if shape.phase != Phase::Running {
        run.transition_to(shape.phase, reason, None, at).unwrap();
    }
    run
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Only terminal runs are collected, and each pipeline keeps its newest
    /// `retention_count` runs.
    #[test]
    fn gc_selects_only_terminal_runs_beyond_retention(
        shapes in prop::collection::vec(arb_run_shape(), 0..30),
        keep in 0usize..5,
        max_age_hours in prop::option::of(1u64..150),
    ) {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let runs: Vec<WorkflowRun> = shapes
            .iter()
            .enumerate()
            .map(|(index, shape)| materialize(index, shape, now))
            .collect();
        let config = ControllerConfig {
            retention_count: Some(keep),
            retention_age_secs: max_age_hours.map(|hours| hours * 3600),
            ..ControllerConfig::default()
        };

        let selected = select_for_collection(&runs, &config, now);

        for run in &selected {
            prop_assert!(run.phase().is_terminal(), "{} is not terminal", run.metadata.name);
        }
        for pipeline in ["backend", "frontend"] {
            let terminal = runs
                .iter()
                .filter(|run| run.spec.pipeline == pipeline && run.phase().is_terminal())
                .count();
            let collected = selected
                .iter()
                .filter(|run| run.spec.pipeline == pipeline)
                .count();
            prop_assert!(collected >= terminal.saturating_sub(keep));
            if max_age_hours.is_none() {
                prop_assert_eq!(collected, terminal.saturating_sub(keep));
            }
        }

        let unique: HashSet<ResourceKey> = selected.iter().map(|run| run.key().unwrap()).collect();
        prop_assert_eq!(unique.len(), selected.len());
    }
}
