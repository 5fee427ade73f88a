//! Custom assertion helpers for integration tests.

use std::time::Duration;

use tideway_core::ResourceKey;
use tideway_controller::model::{Phase, WorkflowRun};
use tideway_controller::store::ResourceStore;

/// How long [`wait_for_phase`] waits before failing the test.
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Asserts that a run is in `expected`.
///
/// # Panics
///
/// Panics if the run is in another phase.
pub fn assert_phase(run: &WorkflowRun, expected: Phase) {
    assert_eq!(
        run.phase(),
        expected,
        "Expected run {} to be {expected}, but it was {} ({:?})",
        run.metadata.name,
        run.phase(),
        run.status.message
    );
}

/// Asserts that no more than `limit` of `runs` are running in `namespace`.
///
/// # Panics
///
/// Panics if the limit is exceeded.
pub fn assert_running_within_limit(runs: &[WorkflowRun], namespace: &str, limit: usize) {
    let running: Vec<&str> = runs
        .iter()
        .filter(|run| run.metadata.namespace.as_deref() == Some(namespace))
        .filter(|run| run.phase() == Phase::Running)
        .map(|run| run.metadata.name.as_str())
        .collect();
    assert!(
        running.len() <= limit,
        "Expected at most {limit} running runs in {namespace}, found {running:?}"
    );
}

/// Polls `check` every few milliseconds until it holds or `timeout` passes.
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Waits until the stored run reaches `phase` and returns it.
///
/// # Panics
///
/// Panics if the run does not reach `phase` within [`CONVERGENCE_TIMEOUT`].
pub async fn wait_for_phase<S>(store: &S, key: &ResourceKey, phase: Phase) -> WorkflowRun
where
    S: ResourceStore<WorkflowRun> + ?Sized,
{
    let deadline = tokio::time::Instant::now() + CONVERGENCE_TIMEOUT;
    loop {
        let run = store.get(key).await.expect("store readable");
        if let Some(run) = run.as_ref().filter(|run| run.phase() == phase) {
            return run.clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Run {key} did not reach {phase}; last seen {:?}",
            run.as_ref().map(WorkflowRun::phase)
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
