//! In-memory broker for tests and local runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::shipping::{Broker, BrokerConnection};

/// A message accepted by [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Topic the message was produced to.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Shared {
    messages: Mutex<Vec<DeliveredMessage>>,
    dials: AtomicUsize,
    failing_dials: AtomicUsize,
    failing_produces: AtomicUsize,
}

/// Records produced messages; dial and produce failures can be injected.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every message produced so far.
    #[must_use]
    pub fn messages(&self) -> Vec<DeliveredMessage> {
        self.shared
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of dial attempts, failed ones included.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.shared.dials.load(Ordering::SeqCst)
    }

    /// Makes the next `count` dials fail.
    pub fn fail_next_dials(&self, count: usize) {
        self.shared.failing_dials.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` produces fail.
    pub fn fail_next_produces(&self, count: usize) {
        self.shared.failing_produces.store(count, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn dial(&self) -> Result<Box<dyn BrokerConnection>> {
        self.shared.dials.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.shared.failing_dials) {
            return Err(Error::transport("injected dial failure"));
        }
        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[derive(Debug)]
struct InMemoryConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn produce(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if take_failure(&self.shared.failing_produces) {
            return Err(Error::transport("injected produce failure"));
        }
        self.shared
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeliveredMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        Ok(())
    }
}
