//! Hot reload of the controller configuration from its config map.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::config::{CONFIG_MAP_DATA_KEY, ControllerConfig, SharedConfig};
use crate::controller::Handler;
use crate::error::{Error, Result};
use crate::model::ConfigMap;
use crate::resource::Resource;

/// Replaces the shared configuration whenever the config map changes.
///
/// Fields read on every decision (concurrency limit, timeouts, retention,
/// sweep intervals) apply immediately. Worker counts, resync period and the
/// config map location only apply on restart.
pub struct ConfigMapHandler {
    config: SharedConfig,
    admission: Arc<AdmissionController>,
}

impl std::fmt::Debug for ConfigMapHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigMapHandler")
            .field("config", &self.config.get())
            .finish_non_exhaustive()
    }
}

impl ConfigMapHandler {
    /// Creates a handler updating `config`.
    #[must_use]
    pub fn new(config: SharedConfig, admission: Arc<AdmissionController>) -> Self {
        Self { config, admission }
    }

    async fn apply(&self, config_map: &ConfigMap) -> Result<()> {
        let key = config_map.key()?;
        let Some(document) = config_map.get(CONFIG_MAP_DATA_KEY) else {
            return Err(Error::InvalidObject {
                kind: ConfigMap::KIND,
                key,
                message: format!("missing data key {CONFIG_MAP_DATA_KEY}"),
            });
        };
        let next = ControllerConfig::from_json(document)?;
        if *self.config.get() == next {
            return Ok(());
        }

        let previous = self.config.replace(next.clone());
        if previous.workers != next.workers
            || previous.resync_period_secs != next.resync_period_secs
            || previous.config_map_namespace != next.config_map_namespace
            || previous.config_map_name != next.config_map_name
        {
            warn!(config_map = %key, "some configuration changes only apply after a restart");
        }
        info!(
            config_map = %key,
            max_concurrent_runs = next.max_concurrent_runs,
            run_timeout_secs = next.run_timeout_secs,
            gc_enabled = next.gc_enabled,
            "configuration reloaded"
        );

        if next.max_concurrent_runs > previous.max_concurrent_runs {
            self.admission.rebalance().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<ConfigMap> for ConfigMapHandler {
    async fn object_created(&self, config_map: &ConfigMap) -> Result<()> {
        self.apply(config_map).await
    }

    async fn object_updated(&self, config_map: &ConfigMap) -> Result<()> {
        self.apply(config_map).await
    }

    async fn object_deleted(&self, config_map: &ConfigMap) -> Result<()> {
        info!(config_map = %config_map.metadata.name, "config map deleted, keeping current configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::model::{Phase, WorkflowRun};
    use crate::shipping::EventPublisher;
    use crate::store::{InMemoryStore, ResourceStore};

    struct Fixture {
        store: Arc<InMemoryStore<WorkflowRun>>,
        config: SharedConfig,
        admission: Arc<AdmissionController>,
        handler: ConfigMapHandler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let config = SharedConfig::new(ControllerConfig {
            max_concurrent_runs: 1,
            ..ControllerConfig::default()
        });
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            config.clone(),
            EventPublisher::disabled(),
        ));
        let handler = ConfigMapHandler::new(config.clone(), admission.clone());
        Fixture {
            store,
            config,
            admission,
            handler,
        }
    }

    fn config_map(document: &str) -> ConfigMap {
        ConfigMap::new("tideway-system", "tideway-config").with_entry(CONFIG_MAP_DATA_KEY, document)
    }

    #[tokio::test]
    async fn applies_new_configuration() {
        let f = fixture();
        f.handler
            .object_created(&config_map(r#"{"max_concurrent_runs": 4, "gc_enabled": false}"#))
            .await
            .unwrap();

        let current = f.config.get();
        assert_eq!(current.max_concurrent_runs, 4);
        assert!(!current.gc_enabled);
        assert_eq!(current.run_timeout_secs, ControllerConfig::default().run_timeout_secs);
    }

    #[tokio::test]
    async fn malformed_document_is_permanent_and_keeps_config() {
        let f = fixture();
        let err = f
            .handler
            .object_updated(&config_map("{not json"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permanent);

        let err = f
            .handler
            .object_updated(&config_map(r#"{"max_concurrent_runs": 0}"#))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(f.config.get().max_concurrent_runs, 1);
    }

    #[tokio::test]
    async fn missing_data_key_is_rejected() {
        let f = fixture();
        let err = f
            .handler
            .object_created(&ConfigMap::new("tideway-system", "tideway-config"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidObject { .. }));
    }

    #[tokio::test]
    async fn raised_limit_promotes_waiting_runs() {
        let f = fixture();
        let a = f
            .store
            .create(WorkflowRun::new("ci", "a", "backend"))
            .await
            .unwrap();
        let b = f
            .store
            .create(WorkflowRun::new("ci", "b", "backend"))
            .await
            .unwrap();
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();

        f.handler
            .object_updated(&config_map(r#"{"max_concurrent_runs": 2}"#))
            .await
            .unwrap();

        let stored = f.store.get(&b.key().unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn deletion_keeps_configuration() {
        let f = fixture();
        f.handler
            .object_created(&config_map(r#"{"max_concurrent_runs": 3}"#))
            .await
            .unwrap();
        f.handler
            .object_deleted(&config_map(r#"{"max_concurrent_runs": 3}"#))
            .await
            .unwrap();
        assert_eq!(f.config.get().max_concurrent_runs, 3);
    }
}
