//! Shipping run lifecycle events to a message broker.
//!
//! Components that win a phase compare-and-swap hand a [`RunEvent`] to the
//! [`EventPublisher`]. Publishing is fire-and-forget: it runs on a spawned
//! task, retries through a [`ReconnectingProducer`], and only logs on
//! failure. A reconcile never waits on, or fails because of, the broker.

pub mod memory;
pub mod producer;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tideway_core::ResourceKey;

use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::model::{Phase, RunReason, WorkflowRun};
use crate::resource::Resource;

pub use memory::{DeliveredMessage, InMemoryBroker};
pub use producer::{Backoff, BoundedBackoff, ProducerState, ReconnectingProducer};

/// Default topic for run lifecycle events.
pub const RUN_EVENTS_TOPIC: &str = "tideway.run-events";

/// Opens connections to a message broker.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Opens a new connection.
    async fn dial(&self) -> Result<Box<dyn BrokerConnection>>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Sends one message.
    async fn produce(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// A workflow run phase change, as shipped to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// Key of the run.
    pub run: ResourceKey,
    /// Pipeline the run belongs to.
    pub pipeline: String,
    /// Phase the run entered.
    pub phase: Phase,
    /// Why the run entered the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RunReason>,
    /// Detail recorded with the phase change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the event was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl RunEvent {
    /// Builds an event from the run's current status.
    ///
    /// Returns `None` if the run's metadata does not form a valid key.
    #[must_use]
    pub fn from_run(run: &WorkflowRun, emitted_at: DateTime<Utc>) -> Option<Self> {
        let run_key = run.key().ok()?;
        Some(Self {
            run: run_key,
            pipeline: run.spec.pipeline.clone(),
            phase: run.status.phase,
            reason: run.status.reason,
            message: run.status.message.clone(),
            emitted_at,
        })
    }
}

/// Best-effort publisher of [`RunEvent`]s.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    producer: Option<Arc<ReconnectingProducer>>,
    topic: String,
    metrics: ControllerMetrics,
}

impl EventPublisher {
    /// Creates a publisher shipping to `topic` through `producer`.
    #[must_use]
    pub fn new(producer: Arc<ReconnectingProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer: Some(producer),
            topic: topic.into(),
            metrics: ControllerMetrics::new(),
        }
    }

    /// Creates a publisher that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            producer: None,
            topic: RUN_EVENTS_TOPIC.to_string(),
            metrics: ControllerMetrics::new(),
        }
    }

    /// Ships `event` on a background task.
    ///
    /// Accepts `None` so callers can pass [`RunEvent::from_run`] straight through.
    pub fn publish(&self, event: Option<RunEvent>) {
        let (Some(event), Some(_)) = (event, &self.producer) else {
            return;
        };
        let publisher = self.clone();
        tokio::spawn(async move {
            if let Err(err) = publisher.publish_now(&event).await {
                warn!(run = %event.run, error = %err, "dropping run event");
            }
        });
    }

    /// Ships `event` and waits for the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or every publish
    /// attempt fails.
    pub async fn publish_now(&self, event: &RunEvent) -> Result<()> {
        let Some(producer) = &self.producer else {
            return Ok(());
        };
        let payload = serde_json::to_vec(event)
            .map_err(|e| Error::serialization(format!("run event: {e}")))?;
        let result = producer.publish(&self.topic, &payload).await;
        self.metrics
            .record_event_published(if result.is_ok() { "delivered" } else { "dropped" });
        result
    }
}
