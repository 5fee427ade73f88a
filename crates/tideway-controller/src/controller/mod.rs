//! Generic level-triggered controller.
//!
//! A [`Controller`] wires one watch source, one [`EventQueue`] and one
//! [`Handler`] together. Workers pull keys from the queue, resolve them
//! against the informer cache and dispatch to the handler by event type.
//!
//! ## Lifecycle
//!
//! ```text
//!   Created ──run──▶ Running ──stop──▶ Stopped
//!      │                                  ▲
//!      └──────────────stop────────────────┘
//! ```
//!
//! ## Failure handling
//!
//! | Handler result | Queue action |
//! |----------------|--------------|
//! | `Ok(())` | `forget` |
//! | transient error | `add_rate_limited` |
//! | permanent error | logged, `forget` |
//!
//! `done` is always called, so a key is never stuck in the processing set.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use tideway_core::observability::controller_span;

use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::metrics::{ControllerMetrics, TimingGuard};
use crate::queue::{EventQueue, ExponentialBackoff, RateLimiter};
use crate::resource::Resource;
use crate::watch::{Cache, Informer, InformerConfig, WatchSource};

/// Reacts to changes of one resource kind.
///
/// Implementations must be idempotent: the same change may be delivered more
/// than once, and an update may arrive for an object whose creation was
/// already handled.
#[async_trait]
pub trait Handler<T: Resource>: Send + Sync {
    /// Called for objects seen for the first time.
    async fn object_created(&self, object: &T) -> Result<()>;

    /// Called for changed or resynced objects.
    async fn object_updated(&self, object: &T) -> Result<()>;

    /// Called with the last known state of a removed object.
    async fn object_deleted(&self, object: &T) -> Result<()>;
}

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, not yet running.
    Created,
    /// Informer and workers are running.
    Running,
    /// Stopped; terminal.
    Stopped,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Controller construction options.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Informer tuning (filter, resync, relist backoff).
    pub informer: InformerConfig,
    /// Retry policy for transient handler failures.
    pub rate_limiter: Arc<dyn RateLimiter>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            informer: InformerConfig::default(),
            rate_limiter: Arc::new(ExponentialBackoff::default()),
        }
    }
}

/// One controller registration: informer + queue + handler.
pub struct Controller<T: Resource> {
    name: String,
    queue: Arc<EventQueue<T>>,
    informer: Informer<T>,
    handler: Arc<dyn Handler<T>>,
    state: Mutex<ControllerState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: ControllerMetrics,
}

impl<T: Resource> std::fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("kind", &T::KIND)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T: Resource> Controller<T> {
    /// Creates a controller in the `Created` state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn WatchSource<T>>,
        handler: Arc<dyn Handler<T>>,
        options: ControllerOptions,
    ) -> Self {
        let name = name.into();
        let queue = Arc::new(EventQueue::with_rate_limiter(options.rate_limiter));
        let informer = Informer::new(name.clone(), source, Arc::clone(&queue), options.informer);
        Self {
            name,
            queue,
            informer,
            handler,
            state: Mutex::new(ControllerState::Created),
            workers: Mutex::new(Vec::new()),
            metrics: ControllerMetrics::new(),
        }
    }

    /// Returns the registration name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the controller's event queue.
    #[must_use]
    pub fn queue(&self) -> Arc<EventQueue<T>> {
        Arc::clone(&self.queue)
    }

    /// Returns the informer cache.
    #[must_use]
    pub fn cache(&self) -> Arc<Cache<T>> {
        self.informer.cache()
    }

    fn transition(&self, action: &'static str, from: &[ControllerState], to: ControllerState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !from.contains(&*state) {
            return Err(Error::Lifecycle {
                component: format!("controller {}", self.name),
                action,
                state: (*state).to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Starts the informer, waits for cache sync, then starts `worker_count` workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller is not in the `Created` state, if
    /// `worker_count` is zero, or if the informer stops before syncing.
    pub async fn run(&self, worker_count: usize) -> Result<()> {
        if worker_count == 0 {
            return Err(Error::configuration(format!(
                "controller {} needs at least one worker",
                self.name
            )));
        }
        self.transition("run", &[ControllerState::Created], ControllerState::Running)?;

        self.informer.start();
        self.informer.wait_for_sync().await?;
        info!(controller = %self.name, kind = T::KIND, workers = worker_count, "cache synced, starting workers");

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..worker_count {
            let worker = Worker {
                name: self.name.clone(),
                queue: Arc::clone(&self.queue),
                cache: self.informer.cache(),
                handler: Arc::clone(&self.handler),
                metrics: self.metrics.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        Ok(())
    }

    /// Shuts the queue down, stops the informer and waits for in-flight workers.
    ///
    /// Handlers already running finish; no new key is handed out.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller is already stopped.
    pub async fn stop(&self) -> Result<()> {
        self.transition(
            "stop",
            &[ControllerState::Created, ControllerState::Running],
            ControllerState::Stopped,
        )?;
        self.queue.shut_down();
        self.informer.stop().await;

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(controller = %self.name, error = %err, "worker ended abnormally");
            }
        }
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }
}

struct Worker<T: Resource> {
    name: String,
    queue: Arc<EventQueue<T>>,
    cache: Arc<Cache<T>>,
    handler: Arc<dyn Handler<T>>,
    metrics: ControllerMetrics,
}

impl<T: Resource> Worker<T> {
    async fn run(self) {
        while let Some(event) = self.queue.get().await {
            self.metrics.set_queue_depth(&self.name, self.queue.len());
            let key = event.key.clone();
            let span = controller_span(&self.name, &key.to_string(), event.event_type.as_str());
            self.process(event).instrument(span).await;
            self.queue.done(&key);
        }
        debug!(controller = %self.name, "worker exiting");
    }

    async fn process(&self, event: Event<T>) {
        let outcome = {
            let _timer = TimingGuard::new(|duration| {
                self.metrics.observe_reconcile_duration(&self.name, duration);
            });
            self.dispatch(&event).await
        };

        let event_type = event.event_type.as_str();
        match outcome {
            Ok(()) => {
                self.metrics.record_reconcile(&self.name, event_type, "success");
                self.queue.forget(&event.key);
            }
            Err(err) if err.is_transient() => {
                self.metrics.record_reconcile(&self.name, event_type, "transient");
                warn!(
                    error = %err,
                    requeues = self.queue.num_requeues(&event.key),
                    "transient reconcile failure, retrying with backoff"
                );
                self.queue.add_rate_limited(event);
            }
            Err(err) => {
                self.metrics.record_reconcile(&self.name, event_type, "permanent");
                error!(error = %err, "permanent reconcile failure, dropping key");
                self.queue.forget(&event.key);
            }
        }
    }

    async fn dispatch(&self, event: &Event<T>) -> Result<()> {
        if event.event_type == EventType::Delete {
            return self.handler.object_deleted(&event.object).await;
        }
        let Some(current) = self.cache.get(&event.key) else {
            debug!("object vanished from cache, handling as deletion");
            return self.handler.object_deleted(&event.object).await;
        };
        match event.event_type {
            EventType::Create => self.handler.object_created(&current).await,
            EventType::Update | EventType::Delete => self.handler.object_updated(&current).await,
        }
    }
}
