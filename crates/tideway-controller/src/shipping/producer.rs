//! Reconnecting message producer.
//!
//! ```text
//!   Disconnected ──dial ok──▶ Connected
//!        ▲                        │
//!        └──── produce failed ────┘
//! ```
//!
//! A publish makes at most [`MAX_PUBLISH_RETRIES`] retries after the first
//! attempt. Every failed attempt (dial or produce) waits out the [`Backoff`]
//! delay for that attempt before the next one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::shipping::{Broker, BrokerConnection};

/// Retries after the first publish attempt.
pub const MAX_PUBLISH_RETRIES: u32 = 3;

/// Delay between publish attempts.
pub trait Backoff: Send + Sync + std::fmt::Debug {
    /// Returns the delay after failed attempt number `attempt` (0-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedBackoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Ceiling on any single delay.
    pub max: Duration,
}

impl Default for BoundedBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff for BoundedBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Connection state of a [`ReconnectingProducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    /// No live connection; the next publish dials.
    Disconnected,
    /// A connection is open.
    Connected,
}

/// Producer that redials its broker after failures.
pub struct ReconnectingProducer {
    broker: Arc<dyn Broker>,
    backoff: Arc<dyn Backoff>,
    connection: Mutex<Option<Box<dyn BrokerConnection>>>,
}

impl std::fmt::Debug for ReconnectingProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingProducer")
            .field("broker", &self.broker)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ReconnectingProducer {
    /// Creates a disconnected producer.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, backoff: Arc<dyn Backoff>) -> Self {
        Self {
            broker,
            backoff,
            connection: Mutex::new(None),
        }
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ProducerState {
        if self.connection.lock().await.is_some() {
            ProducerState::Connected
        } else {
            ProducerState::Disconnected
        }
    }

    /// Publishes `payload` to `topic`, redialing as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] once every attempt has failed.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let mut last_error = None;

        for attempt in 0..=MAX_PUBLISH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
            }

            if connection.is_none() {
                match self.broker.dial().await {
                    Ok(conn) => {
                        debug!(attempt, "broker connection established");
                        *connection = Some(conn);
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "broker dial failed");
                        last_error = Some(err);
                        continue;
                    }
                }
            }

            let Some(conn) = connection.as_ref() else {
                continue;
            };
            match conn.produce(topic, payload).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, error = %err, "produce failed, dropping connection");
                    *connection = None;
                    last_error = Some(err);
                }
            }
        }

        Err(Error::transport(format!(
            "publish to {topic} failed after {} attempts: {}",
            MAX_PUBLISH_RETRIES + 1,
            last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }
}
