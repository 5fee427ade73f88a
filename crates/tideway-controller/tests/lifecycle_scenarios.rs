//! End-to-end workflow run lifecycle scenarios.
//!
//! Each test starts a full process context over in-memory stores and drives
//! it only through store writes, the way users and executors would.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use chrono::{TimeDelta, Utc};

use tideway_controller::config::ControllerConfig;
use tideway_controller::model::{Phase, Pod, PodPhase, RunReason, WorkflowRun};
use tideway_controller::resource::Resource;
use tideway_controller::store::ResourceStore;
use tideway_test_utils::{
    CONVERGENCE_TIMEOUT, RunFactory, TestContext, assert_phase, assert_running_within_limit,
    init_test_logging, test_config, wait_for_phase, wait_until,
};

async fn finish(ctx: &TestContext, run: &WorkflowRun, phase: Phase, reason: RunReason) {
    let mut stored = ctx
        .run(run.metadata.namespace.as_deref().unwrap(), &run.metadata.name)
        .await
        .unwrap();
    stored.transition_to(phase, reason, None, Utc::now()).unwrap();
    ctx.cluster.runs.update(stored).await.unwrap();
}

#[tokio::test]
async fn limit_of_one_hands_the_slot_over() {
    init_test_logging();
    let ctx = TestContext::started(1).await;
    let admission = ctx.context.admission().clone();

    let a = ctx.create_run(RunFactory::pending("ci", "a")).await;
    wait_for_phase(ctx.cluster.runs.as_ref(), &a.key().unwrap(), Phase::Running).await;

    let b = ctx.create_run(RunFactory::pending("ci", "b")).await;
    assert!(wait_until(CONVERGENCE_TIMEOUT, || admission.pending_count("ci") == 1).await);
    assert_phase(&ctx.run("ci", "b").await.unwrap(), Phase::Pending);
    assert_eq!(admission.position(&b.key().unwrap()), Some(1));

    finish(&ctx, &a, Phase::Succeeded, RunReason::Completed).await;

    let b = wait_for_phase(ctx.cluster.runs.as_ref(), &b.key().unwrap(), Phase::Running).await;
    assert_eq!(b.status.reason, Some(RunReason::Admitted));
    let a = ctx.run("ci", "a").await.unwrap();
    assert!(a.status.completed_at.is_some());
    assert!(!admission.is_running(&a.key().unwrap()));
    assert_eq!(admission.running_count("ci"), 1);
    assert_running_within_limit(&ctx.cluster.runs.list().await.unwrap(), "ci", 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn timed_out_run_fails_and_frees_its_slot() {
    init_test_logging();
    let ctx = TestContext::started(1).await;
    let admission = ctx.context.admission().clone();

    let run = ctx
        .create_run(RunFactory::pending("ci", "slow").with_timeout(Duration::from_secs(10)))
        .await;
    let key = run.key().unwrap();
    let running = wait_for_phase(ctx.cluster.runs.as_ref(), &key, Phase::Running).await;
    ctx.cluster
        .pods
        .create(Pod::for_stage(&running, "compile").with_phase(PodPhase::Running))
        .await
        .unwrap();
    let t0 = running.status.started_at.unwrap();

    let early = ctx.context.timeout().sweep_once(t0 + TimeDelta::seconds(5)).await.unwrap();
    assert_eq!(early.timed_out, 0);

    let summary = ctx.context.timeout().sweep_once(t0 + TimeDelta::seconds(15)).await.unwrap();
    assert_eq!(summary.timed_out, 1);

    let failed = ctx.run("ci", "slow").await.unwrap();
    assert_phase(&failed, Phase::Failed);
    assert_eq!(failed.status.reason, Some(RunReason::Timeout));
    assert!(ctx.cluster.pods.is_empty().unwrap());
    assert!(wait_until(CONVERGENCE_TIMEOUT, || admission.running_count("ci") == 0).await);

    let again = ctx.context.timeout().sweep_once(t0 + TimeDelta::seconds(30)).await.unwrap();
    assert_eq!(again.timed_out, 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn deleting_a_pending_run_removes_it_from_the_queue() {
    init_test_logging();
    let ctx = TestContext::started(1).await;
    let admission = ctx.context.admission().clone();

    let a = ctx.create_run(RunFactory::pending("ci", "a")).await;
    wait_for_phase(ctx.cluster.runs.as_ref(), &a.key().unwrap(), Phase::Running).await;
    let b = ctx.create_run(RunFactory::pending("ci", "b")).await;
    assert!(wait_until(CONVERGENCE_TIMEOUT, || admission.pending_count("ci") == 1).await);

    ctx.cluster.runs.delete(&b.key().unwrap()).await.unwrap();
    assert!(wait_until(CONVERGENCE_TIMEOUT, || admission.pending_count("ci") == 0).await);
    assert_eq!(admission.running_count("ci"), 1);

    finish(&ctx, &a, Phase::Succeeded, RunReason::Completed).await;
    assert!(wait_until(CONVERGENCE_TIMEOUT, || admission.running_count("ci") == 0).await);
    assert!(ctx.run("ci", "b").await.is_none());

    ctx.shutdown().await;
}

#[tokio::test]
async fn pods_drive_the_run_to_completion() {
    init_test_logging();
    let ctx = TestContext::started(2).await;

    let run = ctx
        .create_run(RunFactory::pending("ci", "build").with_stages(["compile", "test"]))
        .await;
    let key = run.key().unwrap();
    let running = wait_for_phase(ctx.cluster.runs.as_ref(), &key, Phase::Running).await;

    for stage in ["compile", "test"] {
        let pod = ctx
            .cluster
            .pods
            .create(Pod::for_stage(&running, stage).with_phase(PodPhase::Running))
            .await
            .unwrap();
        let mut done = pod.clone();
        done.status.phase = PodPhase::Succeeded;
        ctx.cluster.pods.update(done).await.unwrap();
    }

    let finished = wait_for_phase(ctx.cluster.runs.as_ref(), &key, Phase::Succeeded).await;
    assert_eq!(finished.status.reason, Some(RunReason::Completed));
    assert_eq!(finished.status.stages.len(), 2);

    ctx.shutdown().await;
}

#[tokio::test]
async fn runs_in_different_namespaces_do_not_share_slots() {
    init_test_logging();
    let ctx = TestContext::started(1).await;

    let a = ctx.create_run(RunFactory::pending("team-a", "build")).await;
    let b = ctx.create_run(RunFactory::pending("team-b", "build")).await;

    wait_for_phase(ctx.cluster.runs.as_ref(), &a.key().unwrap(), Phase::Running).await;
    wait_for_phase(ctx.cluster.runs.as_ref(), &b.key().unwrap(), Phase::Running).await;

    ctx.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_running_runs() {
    init_test_logging();
    let ctx = TestContext::new(ControllerConfig {
        workers: 1,
        ..test_config(1)
    });
    ctx.create_run(RunFactory::running("ci", "survivor", Utc::now()))
        .await;
    let waiting = ctx.create_run(RunFactory::pending("ci", "waiting")).await;

    ctx.context.start().await.unwrap();
    let admission = ctx.context.admission().clone();
    assert!(
        wait_until(CONVERGENCE_TIMEOUT, || {
            admission.running_count("ci") == 1 && admission.pending_count("ci") == 1
        })
        .await
    );
    assert_phase(&ctx.run("ci", "waiting").await.unwrap(), Phase::Pending);

    let survivor = ctx.run("ci", "survivor").await.unwrap();
    finish(&ctx, &survivor, Phase::Failed, RunReason::StageFailed).await;
    wait_for_phase(ctx.cluster.runs.as_ref(), &waiting.key().unwrap(), Phase::Running).await;

    ctx.shutdown().await;
}
