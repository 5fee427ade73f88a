//! Deduplicating work queue between informers and controller workers.
//!
//! The queue holds at most one pending event per key. Adding an event for a
//! key that is already waiting replaces the stored event; adding one for a
//! key that a worker is currently processing parks it until the worker calls
//! [`EventQueue::done`], at which point the key is queued again. This gives
//! two guarantees:
//!
//! - **No duplicate work**: a key is never handed to two workers at once
//! - **No lost work**: a change observed during processing is processed after it
//!
//! Failed keys go back through [`EventQueue::add_rate_limited`], which waits
//! out a per-key [`RateLimiter`] delay before re-adding.

pub mod rate_limit;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use tideway_core::ResourceKey;

use crate::event::Event;

pub use rate_limit::{ExponentialBackoff, RateLimiter};

#[derive(Debug)]
struct QueueState<T> {
    /// Keys ready to be handed out, in arrival order.
    queue: VecDeque<ResourceKey>,
    /// Latest event for every key waiting in `queue` or parked behind a worker.
    dirty: HashMap<ResourceKey, Event<T>>,
    /// Keys currently held by a worker.
    processing: HashSet<ResourceKey>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited event queue.
///
/// ## Example
///
/// ```rust
/// use tideway_controller::event::{Event, EventType};
/// use tideway_controller::queue::EventQueue;
/// use tideway_core::ResourceKey;
///
/// # tokio_test::block_on(async {
/// let queue = EventQueue::new();
/// let key = ResourceKey::new("ci", "build-1").unwrap();
/// queue.add(Event::new(key.clone(), EventType::Create, 1));
/// queue.add(Event::new(key.clone(), EventType::Update, 2));
/// assert_eq!(queue.len(), 1);
///
/// let event = queue.get().await.unwrap();
/// assert_eq!(event.object, 2);
/// queue.done(&key);
/// # });
/// ```
#[derive(Debug)]
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl<T: Clone + Send + 'static> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventQueue<T> {
    /// Creates a queue with the default exponential backoff.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rate_limiter(Arc::new(ExponentialBackoff::default()))
    }

    /// Creates a queue with a custom retry policy.
    #[must_use]
    pub fn with_rate_limiter(rate_limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashMap::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
            rate_limiter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an event, superseding any event already waiting for its key.
    ///
    /// Ignored after [`Self::shut_down`].
    pub fn add(&self, event: Event<T>) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        let key = event.key.clone();
        if state.dirty.insert(key.clone(), event).is_some() {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.available.notify_one();
    }

    /// Waits for the next key and marks it as processing.
    ///
    /// Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<Event<T>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.queue.pop_front() {
                    let Some(event) = state.dirty.remove(&key) else {
                        continue;
                    };
                    state.processing.insert(key);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.available.notify_one();
                    }
                    return Some(event);
                }
            }

            notified.await;
        }
    }

    /// Marks a key as no longer processing.
    ///
    /// If the key was re-added while it was being processed it is queued again.
    pub fn done(&self, key: &ResourceKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.shutting_down || !state.dirty.contains_key(key) {
            return;
        }
        state.queue.push_back(key.clone());
        drop(state);
        self.available.notify_one();
    }

    /// Re-adds an event after the rate limiter's delay for its key.
    ///
    /// If a newer event for the key arrives during the delay, the delayed one
    /// is discarded.
    pub fn add_rate_limited(self: &Arc<Self>, event: Event<T>) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.rate_limiter.when(&event.key);
        tracing::debug!(key = %event.key, delay_ms = delay.as_millis(), "requeueing after backoff");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add_if_absent(event);
        });
    }

    fn add_if_absent(&self, event: Event<T>) {
        if self.lock().dirty.contains_key(&event.key) {
            return;
        }
        self.add(event);
    }

    /// Clears the retry history of a key.
    pub fn forget(&self, key: &ResourceKey) {
        self.rate_limiter.forget(key);
    }

    /// Returns how many times `key` has been retried since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Stops handing out work. Waiting and future [`Self::get`] calls return `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.available.notify_waiters();
    }

    /// Returns true once [`Self::shut_down`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Returns the number of keys ready to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no key is ready to be handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of keys currently held by workers.
    #[must_use]
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use std::time::Duration;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("ci", name).unwrap()
    }

    fn event(name: &str, event_type: EventType, value: u32) -> Event<u32> {
        Event::new(key(name), event_type, value)
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce_last_write_wins() {
        let queue = EventQueue::new();
        queue.add(event("a", EventType::Create, 1));
        queue.add(event("a", EventType::Update, 2));
        queue.add(event("a", EventType::Delete, 3));
        assert_eq!(queue.len(), 1);

        let got = queue.get().await.unwrap();
        assert_eq!(got.event_type, EventType::Delete);
        assert_eq!(got.object, 3);
    }

    #[tokio::test]
    async fn keys_are_handed_out_in_arrival_order() {
        let queue = EventQueue::new();
        queue.add(event("a", EventType::Create, 1));
        queue.add(event("b", EventType::Create, 2));
        queue.add(event("a", EventType::Update, 3));

        assert_eq!(queue.get().await.unwrap().key, key("a"));
        assert_eq!(queue.get().await.unwrap().key, key("b"));
    }

    #[tokio::test]
    async fn key_added_during_processing_is_parked_until_done() {
        let queue = EventQueue::new();
        queue.add(event("a", EventType::Create, 1));
        let first = queue.get().await.unwrap();

        queue.add(event("a", EventType::Update, 2));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.processing_len(), 1);

        queue.done(&first.key);
        assert_eq!(queue.len(), 1);
        let second = queue.get().await.unwrap();
        assert_eq!(second.object, 2);
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let queue = EventQueue::new();
        queue.add(event("a", EventType::Create, 1));
        let got = queue.get().await.unwrap();
        queue.done(&got.key);
        assert!(queue.is_empty());
        assert_eq!(queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_ignores_adds() {
        let queue = Arc::new(EventQueue::<u32>::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert!(waiter.await.unwrap().is_none());

        queue.add(event("a", EventType::Create, 1));
        assert!(queue.is_empty());
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let queue = Arc::new(EventQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(event("a", EventType::Create, 7));
        assert_eq!(waiter.await.unwrap().unwrap().object, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let queue = Arc::new(EventQueue::new());
        queue.add_rate_limited(event("a", EventType::Update, 1));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_requeues(&key("a")), 1);

        queue.forget(&key("a"));
        assert_eq!(queue.num_requeues(&key("a")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_readd_never_overwrites_newer_event() {
        let queue = Arc::new(EventQueue::new());
        queue.add_rate_limited(event("a", EventType::Update, 1));
        queue.add(event("a", EventType::Update, 2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let got = queue.get().await.unwrap();
        assert_eq!(got.object, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_key_is_never_held_by_two_workers() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let queue = Arc::new(EventQueue::new());
        let in_flight = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let in_flight = Arc::clone(&in_flight);
            let processed = Arc::clone(&processed);
            let overlap = Arc::clone(&overlap);
            workers.push(tokio::spawn(async move {
                while let Some(event) = queue.get().await {
                    if in_flight.swap(true, Ordering::SeqCst) {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_flight.store(false, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&event.key);
                }
            }));
        }

        for value in 0..50 {
            queue.add(event("same", EventType::Update, value));
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
        while !queue.is_empty() || queue.processing_len() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst));
        assert!(processed.load(Ordering::SeqCst) >= 1);
    }
}
