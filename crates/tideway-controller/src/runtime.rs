//! Process-scoped wiring of the controller.
//!
//! [`ProcessContext`] owns everything one controller process runs: a
//! controller registration per watched kind, the admission controller, the
//! timeout and GC sweeps and the shared configuration.
//!
//! ```text
//!   start:    config map ─▶ workflow runs ─▶ pods ─▶ timeout + gc loops
//!   shutdown: loops ─▶ pods ─▶ workflow runs ─▶ config map
//! ```
//!
//! The config map controller starts first so the runtime configuration is in
//! place before the first run is admitted.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::config::{ControllerConfig, SharedConfig};
use crate::controller::{Controller, ControllerOptions, ControllerState};
use crate::error::{Error, Result};
use crate::gc::GcProcessor;
use crate::handlers::{ConfigMapHandler, PodHandler, WorkflowRunHandler};
use crate::model::pod::{LABEL_MANAGED_BY, MANAGED_BY_VALUE};
use crate::model::{ConfigMap, Pod, WorkflowRun};
use crate::resource::Resource;
use crate::shipping::EventPublisher;
use crate::store::{InMemoryStore, ResourceStore};
use crate::timeout::{PodTerminator, TimeoutProcessor};
use crate::watch::{InformerConfig, WatchFilter, WatchSource};

/// Read/write and watch access to one resource kind.
pub struct ResourceApi<T: Resource> {
    /// Keyed CRUD access.
    pub store: Arc<dyn ResourceStore<T>>,
    /// List/watch access.
    pub watch: Arc<dyn WatchSource<T>>,
}

impl<T: Resource> Clone for ResourceApi<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            watch: Arc::clone(&self.watch),
        }
    }
}

impl<T: Resource> ResourceApi<T> {
    /// Serves both halves from one in-memory store.
    #[must_use]
    pub fn in_memory(store: Arc<InMemoryStore<T>>) -> Self {
        Self {
            store: store.clone(),
            watch: store,
        }
    }
}

/// The cluster APIs the controller process talks to.
#[derive(Clone)]
pub struct ClusterApis {
    /// Workflow runs.
    pub runs: ResourceApi<WorkflowRun>,
    /// Stage pods.
    pub pods: ResourceApi<Pod>,
    /// Config maps (owned sub-resources and the controller config map).
    pub config_maps: ResourceApi<ConfigMap>,
}

/// In-memory stores backing [`ClusterApis::in_memory`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryCluster {
    /// Workflow runs.
    pub runs: Arc<InMemoryStore<WorkflowRun>>,
    /// Stage pods.
    pub pods: Arc<InMemoryStore<Pod>>,
    /// Config maps.
    pub config_maps: Arc<InMemoryStore<ConfigMap>>,
}

impl ClusterApis {
    /// Builds APIs over in-memory stores.
    #[must_use]
    pub fn in_memory(cluster: &InMemoryCluster) -> Self {
        Self {
            runs: ResourceApi::in_memory(Arc::clone(&cluster.runs)),
            pods: ResourceApi::in_memory(Arc::clone(&cluster.pods)),
            config_maps: ResourceApi::in_memory(Arc::clone(&cluster.config_maps)),
        }
    }
}

/// Everything a controller process runs, with an explicit lifecycle.
pub struct ProcessContext {
    config: SharedConfig,
    admission: Arc<AdmissionController>,
    timeout: Arc<TimeoutProcessor>,
    gc: Arc<GcProcessor>,
    runs: Arc<Controller<WorkflowRun>>,
    pods: Arc<Controller<Pod>>,
    config_maps: Arc<Controller<ConfigMap>>,
    state: Mutex<ControllerState>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("state", &self.state())
            .field("config", &self.config.get())
            .finish_non_exhaustive()
    }
}

impl ProcessContext {
    /// Wires controllers, policies and sweeps over `apis`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(config: ControllerConfig, apis: ClusterApis, publisher: EventPublisher) -> Result<Self> {
        config.validate()?;
        let resync_period = config.resync_period();
        let config_map_filter = WatchFilter::all()
            .namespace(config.config_map_namespace.clone())
            .name(config.config_map_name.clone());
        let config = SharedConfig::new(config);

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&apis.runs.store),
            config.clone(),
            publisher.clone(),
        ));
        let timeout = Arc::new(TimeoutProcessor::new(
            Arc::clone(&apis.runs.store),
            Arc::new(PodTerminator::new(Arc::clone(&apis.pods.store))),
            config.clone(),
            publisher.clone(),
        ));
        let gc = Arc::new(GcProcessor::new(
            Arc::clone(&apis.runs.store),
            Arc::clone(&apis.pods.store),
            Arc::clone(&apis.config_maps.store),
            config.clone(),
        ));

        let options = |filter: WatchFilter| ControllerOptions {
            informer: InformerConfig {
                filter,
                resync_period,
                ..InformerConfig::default()
            },
            ..ControllerOptions::default()
        };
        let runs = Arc::new(Controller::new(
            "workflow-run",
            Arc::clone(&apis.runs.watch),
            Arc::new(WorkflowRunHandler::new(
                Arc::clone(&admission),
                Arc::clone(&apis.runs.store),
            )),
            options(WatchFilter::all()),
        ));
        let pods = Arc::new(Controller::new(
            "pod",
            Arc::clone(&apis.pods.watch),
            Arc::new(PodHandler::new(Arc::clone(&apis.runs.store), publisher)),
            options(WatchFilter::all().label(LABEL_MANAGED_BY, MANAGED_BY_VALUE)),
        ));
        let config_maps = Arc::new(Controller::new(
            "config-map",
            Arc::clone(&apis.config_maps.watch),
            Arc::new(ConfigMapHandler::new(config.clone(), Arc::clone(&admission))),
            options(config_map_filter),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            admission,
            timeout,
            gc,
            runs,
            pods,
            config_maps,
            state: Mutex::new(ControllerState::Created),
            shutdown,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the shared configuration handle.
    #[must_use]
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Returns the admission controller.
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Returns the timeout processor.
    #[must_use]
    pub fn timeout(&self) -> &Arc<TimeoutProcessor> {
        &self.timeout
    }

    /// Returns the garbage collector.
    #[must_use]
    pub fn gc(&self) -> &Arc<GcProcessor> {
        &self.gc
    }

    fn transition(&self, action: &'static str, from: ControllerState, to: ControllerState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(Error::Lifecycle {
                component: "process context".to_string(),
                action,
                state: state.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Starts every controller, then the timeout and GC loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the context was already started, or a controller
    /// fails to start.
    pub async fn start(&self) -> Result<()> {
        self.transition("start", ControllerState::Created, ControllerState::Running)?;
        let workers = self.config.get().workers;

        self.config_maps.run(1).await?;
        self.runs.run(workers).await?;
        self.pods.run(workers).await?;

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        loops.push(tokio::spawn(
            Arc::clone(&self.timeout).run(self.shutdown.subscribe()),
        ));
        loops.push(tokio::spawn(Arc::clone(&self.gc).run(self.shutdown.subscribe())));
        info!(workers, "controller process started");
        Ok(())
    }

    /// Stops the sweeps and every controller, waiting for in-flight work.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is not running.
    pub async fn shutdown(&self) -> Result<()> {
        self.transition("shut down", ControllerState::Running, ControllerState::Stopped)?;
        self.shutdown.send_replace(true);
        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in loops {
            if let Err(err) = handle.await {
                warn!(error = %err, "background loop ended abnormally");
            }
        }

        for result in [
            self.pods.stop().await,
            self.runs.stop().await,
            self.config_maps.stop().await,
        ] {
            if let Err(err) = result {
                warn!(error = %err, "controller did not stop cleanly");
            }
        }
        info!("controller process stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_configuration() {
        let cluster = InMemoryCluster::default();
        let err = ProcessContext::new(
            ControllerConfig {
                workers: 0,
                ..ControllerConfig::default()
            },
            ClusterApis::in_memory(&cluster),
            EventPublisher::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let cluster = InMemoryCluster::default();
        let context = ProcessContext::new(
            ControllerConfig::default(),
            ClusterApis::in_memory(&cluster),
            EventPublisher::disabled(),
        )
        .unwrap();

        assert!(context.shutdown().await.is_err());
        context.start().await.unwrap();
        assert_eq!(context.state(), ControllerState::Running);
        assert!(context.start().await.is_err());
        context.shutdown().await.unwrap();
        assert_eq!(context.state(), ControllerState::Stopped);
        assert!(context.shutdown().await.is_err());
    }
}
