//! List-then-watch mirroring of a watch source into a cache and a queue.
//!
//! An informer runs one background task:
//!
//! 1. open a watch stream, then list (so nothing written in between is missed)
//! 2. replace the cache with the listing and enqueue every object
//! 3. signal cache sync (first pass only)
//! 4. apply watch events to the cache and enqueue them until the stream ends
//! 5. wait out the relist backoff and start again
//!
//! An optional resync period re-enqueues every cached object as an update,
//! which lets level-triggered handlers repair drift that no event announced.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::queue::EventQueue;
use crate::resource::Resource;
use crate::watch::{Cache, WatchEvent, WatchFilter, WatchSource};

/// Informer tuning.
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Objects the informer mirrors.
    pub filter: WatchFilter,
    /// Period of full re-enqueues of the cache; `None` disables resync.
    pub resync_period: Option<Duration>,
    /// Delay before re-listing after a watch stream ends or fails.
    pub relist_backoff: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            filter: WatchFilter::all(),
            resync_period: None,
            relist_backoff: Duration::from_secs(1),
        }
    }
}

/// Mirrors one watch source into a [`Cache`] and an [`EventQueue`].
pub struct Informer<T: Resource> {
    name: String,
    source: Arc<dyn WatchSource<T>>,
    cache: Arc<Cache<T>>,
    queue: Arc<EventQueue<T>>,
    config: InformerConfig,
    synced_rx: watch::Receiver<bool>,
    synced_tx: Arc<watch::Sender<bool>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Resource> std::fmt::Debug for Informer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("synced", &*self.synced_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl<T: Resource> Informer<T> {
    /// Creates an informer feeding `queue`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn WatchSource<T>>,
        queue: Arc<EventQueue<T>>,
        config: InformerConfig,
    ) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            source,
            cache: Arc::new(Cache::new()),
            queue,
            config,
            synced_rx,
            synced_tx: Arc::new(synced_tx),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Returns the informer's cache.
    #[must_use]
    pub fn cache(&self) -> Arc<Cache<T>> {
        Arc::clone(&self.cache)
    }

    /// Returns true once the initial listing has been cached and enqueued.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Spawns the list/watch task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        let task = InformerTask {
            name: self.name.clone(),
            source: Arc::clone(&self.source),
            cache: Arc::clone(&self.cache),
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            synced_tx: Arc::clone(&self.synced_tx),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        *handle = Some(tokio::spawn(task.run()));
    }

    /// Waits until the initial listing is cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the informer stops before syncing.
    pub async fn wait_for_sync(&self) -> Result<()> {
        let mut synced = self.synced_rx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *synced.borrow_and_update() {
                return Ok(());
            }
            if *shutdown.borrow_and_update() {
                return Err(self.not_running("sync"));
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return Err(self.not_running("sync"));
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    fn not_running(&self, action: &'static str) -> Error {
        Error::Lifecycle {
            component: format!("informer {}", self.name),
            action,
            state: "stopped".to_string(),
        }
    }

    /// Stops the list/watch task and waits for it to exit.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(informer = %self.name, error = %err, "informer task ended abnormally");
            }
        }
    }
}

struct InformerTask<T: Resource> {
    name: String,
    source: Arc<dyn WatchSource<T>>,
    cache: Arc<Cache<T>>,
    queue: Arc<EventQueue<T>>,
    config: InformerConfig,
    synced_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// How one list/watch pass ended.
enum PassEnd {
    Shutdown,
    StreamClosed,
}

impl<T: Resource> InformerTask<T> {
    async fn run(mut self) {
        info!(informer = %self.name, "informer started");
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.list_and_watch().await {
                Ok(PassEnd::Shutdown) => break,
                Ok(PassEnd::StreamClosed) => {
                    debug!(informer = %self.name, "watch stream closed, relisting");
                }
                Err(err) => {
                    warn!(informer = %self.name, error = %err, "list/watch failed, retrying");
                }
            }
            tokio::select! {
                _ = self.shutdown_rx.changed() => {}
                () = tokio::time::sleep(self.config.relist_backoff) => {}
            }
        }
        info!(informer = %self.name, "informer stopped");
    }

    async fn list_and_watch(&mut self) -> Result<PassEnd> {
        let mut stream = self.source.watch(&self.config.filter).await?;
        let listed = self.source.list(&self.config.filter).await?;
        self.apply_listing(listed)?;
        self.synced_tx.send_if_modified(|synced| !std::mem::replace(synced, true));

        let mut resync = self.config.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return Ok(PassEnd::Shutdown),
                event = stream.next() => match event {
                    Some(event) => self.apply_event(event)?,
                    None => return Ok(PassEnd::StreamClosed),
                },
                _ = async {
                    match resync.as_mut() {
                        Some(interval) => interval.tick().await,
                        None => std::future::pending().await,
                    }
                } => self.resync(),
            }
        }
    }

    fn apply_listing(&self, listed: Vec<T>) -> Result<()> {
        let mut entries = Vec::with_capacity(listed.len());
        for object in listed {
            entries.push((object.key()?, object));
        }
        let known: Vec<bool> = entries
            .iter()
            .map(|(key, _)| self.cache.get(key).is_some())
            .collect();
        let vanished = self.cache.replace(entries.clone());
        for ((key, object), was_known) in entries.into_iter().zip(known) {
            let event_type = if was_known {
                EventType::Update
            } else {
                EventType::Create
            };
            self.queue.add(Event::new(key, event_type, object));
        }
        for (key, tombstone) in vanished {
            self.queue.add(Event::new(key, EventType::Delete, tombstone));
        }
        debug!(informer = %self.name, cached = self.cache.len(), "listing applied");
        Ok(())
    }

    fn apply_event(&self, event: WatchEvent<T>) -> Result<()> {
        match event {
            WatchEvent::Added(object) => {
                let key = object.key()?;
                if self.cache.upsert(key.clone(), object.clone()) {
                    self.queue.add(Event::new(key, EventType::Create, object));
                }
            }
            WatchEvent::Modified(object) => {
                let key = object.key()?;
                if self.cache.upsert(key.clone(), object.clone()) {
                    self.queue.add(Event::new(key, EventType::Update, object));
                }
            }
            WatchEvent::Deleted(object) => {
                let key = object.key()?;
                if self.cache.remove(&key, &object).is_some() {
                    self.queue.add(Event::new(key, EventType::Delete, object));
                }
            }
        }
        Ok(())
    }

    fn resync(&self) {
        let objects = self.cache.list();
        debug!(informer = %self.name, objects = objects.len(), "resync");
        for object in objects {
            match object.key() {
                Ok(key) => self.queue.add(Event::new(key, EventType::Update, object)),
                Err(err) => warn!(informer = %self.name, error = %err, "skipping uncacheable object"),
            }
        }
    }
}
