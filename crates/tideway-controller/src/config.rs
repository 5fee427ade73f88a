//! Controller configuration.
//!
//! Configuration is assembled in three layers:
//!
//! 1. defaults ([`ControllerConfig::default`])
//! 2. `TIDEWAY_*` environment variables ([`ControllerConfig::from_env`])
//! 3. the JSON document in the controller's config map, applied at runtime
//!    through [`SharedConfig::replace`]
//!
//! Policies read the current value through [`SharedConfig::get`] on every
//! decision, so a config map change takes effect without a restart.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Data key of the controller config map holding the JSON document.
pub const CONFIG_MAP_DATA_KEY: &str = "config.json";

/// Runtime configuration of the controller process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Cap on concurrently running runs per admission scope.
    pub max_concurrent_runs: usize,
    /// Deadline for runs that do not declare their own, in seconds.
    pub run_timeout_secs: u64,
    /// Whether garbage collection sweeps do anything.
    pub gc_enabled: bool,
    /// Terminal runs kept per pipeline; older ones are collected.
    pub retention_count: Option<usize>,
    /// Age after completion at which terminal runs are collected, in seconds.
    pub retention_age_secs: Option<u64>,
    /// Grace period before ownerless sub-resources are collected, in seconds.
    pub orphan_grace_secs: u64,
    /// Workers per controller registration.
    pub workers: usize,
    /// Period of the timeout sweep, in seconds.
    pub timeout_interval_secs: u64,
    /// Period of the garbage collection sweep, in seconds.
    pub gc_interval_secs: u64,
    /// Period of informer resyncs, in seconds; `None` disables resync.
    pub resync_period_secs: Option<u64>,
    /// Namespace of the controller config map.
    pub config_map_namespace: String,
    /// Name of the controller config map.
    pub config_map_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 10,
            run_timeout_secs: 60 * 60,
            gc_enabled: true,
            retention_count: Some(50),
            retention_age_secs: Some(7 * 24 * 60 * 60),
            orphan_grace_secs: 10 * 60,
            workers: 2,
            timeout_interval_secs: 30,
            gc_interval_secs: 5 * 60,
            resync_period_secs: Some(5 * 60),
            config_map_namespace: "tideway-system".to_string(),
            config_map_name: "tideway-config".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from `TIDEWAY_*` environment variables over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(limit) = env.usize("TIDEWAY_MAX_CONCURRENT_RUNS")? {
            config.max_concurrent_runs = limit;
        }
        if let Some(timeout) = env.u64("TIDEWAY_RUN_TIMEOUT_SECS")? {
            config.run_timeout_secs = timeout;
        }
        if let Some(enabled) = env.bool("TIDEWAY_GC_ENABLED")? {
            config.gc_enabled = enabled;
        }
        if let Some(count) = env.usize("TIDEWAY_RETENTION_COUNT")? {
            config.retention_count = (count > 0).then_some(count);
        }
        if let Some(age) = env.u64("TIDEWAY_RETENTION_AGE_SECS")? {
            config.retention_age_secs = (age > 0).then_some(age);
        }
        if let Some(grace) = env.u64("TIDEWAY_ORPHAN_GRACE_SECS")? {
            config.orphan_grace_secs = grace;
        }
        if let Some(workers) = env.usize("TIDEWAY_WORKERS")? {
            config.workers = workers;
        }
        if let Some(interval) = env.u64("TIDEWAY_TIMEOUT_INTERVAL_SECS")? {
            config.timeout_interval_secs = interval;
        }
        if let Some(interval) = env.u64("TIDEWAY_GC_INTERVAL_SECS")? {
            config.gc_interval_secs = interval;
        }
        if let Some(period) = env.u64("TIDEWAY_RESYNC_PERIOD_SECS")? {
            config.resync_period_secs = (period > 0).then_some(period);
        }
        if let Some(namespace) = env.string("TIDEWAY_CONFIG_MAP_NAMESPACE") {
            config.config_map_namespace = namespace;
        }
        if let Some(name) = env.string("TIDEWAY_CONFIG_MAP_NAME") {
            config.config_map_name = name;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or the result is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid controller config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that limits, worker counts and intervals are positive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_concurrent_runs", self.max_concurrent_runs as u64),
            ("workers", self.workers as u64),
            ("run_timeout_secs", self.run_timeout_secs),
            ("timeout_interval_secs", self.timeout_interval_secs),
            ("gc_interval_secs", self.gc_interval_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::configuration(format!("{field} must be positive")));
            }
        }
        if self.config_map_name.trim().is_empty() {
            return Err(Error::configuration("config_map_name must not be empty"));
        }
        Ok(())
    }

    /// Default run deadline.
    #[must_use]
    pub const fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Retention age of terminal runs.
    #[must_use]
    pub fn retention_age(&self) -> Option<Duration> {
        self.retention_age_secs.map(Duration::from_secs)
    }

    /// Grace period for ownerless sub-resources.
    #[must_use]
    pub const fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    /// Timeout sweep period.
    #[must_use]
    pub const fn timeout_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_interval_secs)
    }

    /// GC sweep period.
    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    /// Informer resync period.
    #[must_use]
    pub fn resync_period(&self) -> Option<Duration> {
        self.resync_period_secs.map(Duration::from_secs)
    }
}

/// Process-wide configuration handle, swapped atomically on reload.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<ControllerConfig>>>,
}

impl SharedConfig {
    /// Wraps an initial configuration.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Returns the current configuration.
    #[must_use]
    pub fn get(&self) -> Arc<ControllerConfig> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the configuration, returning the previous one.
    pub fn replace(&self, config: ControllerConfig) -> Arc<ControllerConfig> {
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(config))
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
