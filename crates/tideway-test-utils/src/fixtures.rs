//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create test data with sensible defaults.

use chrono::{DateTime, Utc};

use tideway_core::ResourceKey;
use tideway_controller::config::ControllerConfig;
use tideway_controller::model::{Phase, RunReason, WorkflowRun};
use tideway_controller::runtime::{ClusterApis, InMemoryCluster, ProcessContext};
use tideway_controller::shipping::EventPublisher;
use tideway_controller::store::ResourceStore;

/// Pipeline used by factory runs unless stated otherwise.
pub const TEST_PIPELINE: &str = "backend";

/// Configuration for integration tests: the given limit, no resync, and
/// sweep intervals long enough that tests drive sweeps themselves.
#[must_use]
pub fn test_config(max_concurrent_runs: usize) -> ControllerConfig {
    ControllerConfig {
        max_concurrent_runs,
        workers: 2,
        timeout_interval_secs: 24 * 60 * 60,
        gc_interval_secs: 24 * 60 * 60,
        resync_period_secs: None,
        ..ControllerConfig::default()
    }
}

/// Factory for workflow runs in each lifecycle phase.
pub struct RunFactory;

impl RunFactory {
    /// Creates a pending run of [`TEST_PIPELINE`].
    #[must_use]
    pub fn pending(namespace: &str, name: &str) -> WorkflowRun {
        WorkflowRun::new(namespace, name, TEST_PIPELINE)
    }

    /// Creates a run admitted at `started_at`.
    #[must_use]
    pub fn running(namespace: &str, name: &str, started_at: DateTime<Utc>) -> WorkflowRun {
        let mut run = Self::pending(namespace, name);
        run.transition_to(Phase::Running, RunReason::Admitted, None, started_at)
            .expect("pending run can start");
        run
    }

    /// Creates a run of `pipeline` that succeeded at `completed_at`.
    #[must_use]
    pub fn succeeded(
        namespace: &str,
        name: &str,
        pipeline: &str,
        completed_at: DateTime<Utc>,
    ) -> WorkflowRun {
        let mut run = WorkflowRun::new(namespace, name, pipeline);
        run.transition_to(Phase::Running, RunReason::Admitted, None, completed_at)
            .expect("pending run can start");
        run.transition_to(Phase::Succeeded, RunReason::Completed, None, completed_at)
            .expect("running run can succeed");
        run
    }
}

/// In-memory cluster with a process context wired to it.
pub struct TestContext {
    /// Backing stores, for arranging and inspecting cluster state.
    pub cluster: InMemoryCluster,
    /// The controller process under test.
    pub context: ProcessContext,
}

impl TestContext {
    /// Creates a context that is not yet started.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        let cluster = InMemoryCluster::default();
        let context = ProcessContext::new(config, ClusterApis::in_memory(&cluster), EventPublisher::disabled())
            .expect("valid test configuration");
        Self { cluster, context }
    }

    /// Creates and starts a context with [`test_config`].
    pub async fn started(max_concurrent_runs: usize) -> Self {
        let ctx = Self::new(test_config(max_concurrent_runs));
        ctx.context.start().await.expect("context starts");
        ctx
    }

    /// Stores a run and returns it with its assigned identity.
    pub async fn create_run(&self, run: WorkflowRun) -> WorkflowRun {
        self.cluster.runs.create(run).await.expect("run created")
    }

    /// Reads a run back from the store.
    pub async fn run(&self, namespace: &str, name: &str) -> Option<WorkflowRun> {
        let key = ResourceKey::new(namespace, name).expect("valid key");
        self.cluster.runs.get(&key).await.expect("store readable")
    }

    /// Stops the process context.
    pub async fn shutdown(&self) {
        self.context.shutdown().await.expect("context shuts down");
    }
}
