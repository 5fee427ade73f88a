//! Admission control: cap concurrently running runs per scope.
//!
//! Each admission scope (a namespace, or [`DEFAULT_SCOPE`](tideway_core::DEFAULT_SCOPE)
//! for cluster-scoped runs) holds a set of runs occupying a slot and a FIFO of
//! runs waiting for one. Slot accounting happens under a lock; the phase change
//! itself is a compare-and-swap against the store, so the persisted phase is
//! always the source of truth.
//!
//! ```text
//!   try_admit ──▶ slot free, nobody waiting ──▶ reserve ──▶ CAS Pending→Running
//!       │                                                     │
//!       └──▶ otherwise: append to pending FIFO                └─ lost: roll back
//!
//!   release ──▶ slot freed ──▶ pop oldest pending ──▶ CAS Pending→Running
//! ```
//!
//! `try_admit` never waits for capacity; a run that does not get a slot simply
//! stays `Pending` until a release promotes it.
//!
//! Entries remember the UID of the object that created them. A run deleted and
//! recreated under the same name may reach the controller as a single event,
//! so an entry whose UID differs from the observed object is dropped as stale
//! before any decision is taken.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};

use tideway_core::{ObjectUid, ResourceKey};

use crate::config::SharedConfig;
use crate::error::Result;
use crate::metrics::ControllerMetrics;
use crate::model::{Phase, RunReason, WorkflowRun};
use crate::resource::Resource;
use crate::shipping::{EventPublisher, RunEvent};
use crate::store::{CasResult, PhaseTransition, ResourceStore, cas_phase};

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was reserved and the run moved to `Running`.
    Admitted,
    /// The run already holds a slot.
    AlreadyRunning,
    /// No slot is free; the run waits at `position` (1-based) in its scope.
    Queued {
        /// Place in the scope's FIFO.
        position: usize,
    },
    /// The run is no longer pending (finished or deleted); nothing was reserved.
    Stale,
}

impl Admission {
    /// Returns the decision name used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::AlreadyRunning => "already_running",
            Self::Queued { .. } => "queued",
            Self::Stale => "stale",
        }
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    running: HashMap<ResourceKey, Option<ObjectUid>>,
    pending: VecDeque<(ResourceKey, Option<ObjectUid>)>,
}

impl ScopeState {
    fn position(&self, key: &ResourceKey) -> Option<usize> {
        self.pending.iter().position(|(k, _)| k == key).map(|i| i + 1)
    }

    /// Removes the entries of `key` whose UID satisfies `matches`.
    ///
    /// Returns true if a running slot was freed.
    fn remove<F>(&mut self, key: &ResourceKey, matches: F) -> bool
    where
        F: Fn(Option<ObjectUid>) -> bool,
    {
        let freed = self.running.get(key).is_some_and(|held| matches(*held))
            && self.running.remove(key).is_some();
        self.pending.retain(|(k, held)| k != key || !matches(*held));
        freed
    }

    /// Drops entries of `key` left behind by an earlier object with that name.
    ///
    /// Returns true if anything was dropped.
    fn evict_replaced(&mut self, key: &ResourceKey, uid: Option<ObjectUid>) -> bool {
        let queued = self.pending.len();
        let freed = self.remove(key, |held| held != uid);
        freed || self.pending.len() != queued
    }
}

/// Decision taken under the scope lock.
enum Reservation {
    Reserved { from_pending: bool },
    Running,
    Queued(usize),
}

/// Per-scope concurrency limiter for workflow runs.
pub struct AdmissionController {
    store: Arc<dyn ResourceStore<WorkflowRun>>,
    config: SharedConfig,
    scopes: Mutex<HashMap<String, ScopeState>>,
    publisher: EventPublisher,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("limit", &self.limit())
            .field("scopes", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Creates an admission controller reading its limit from `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore<WorkflowRun>>,
        config: SharedConfig,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            config,
            scopes: Mutex::new(HashMap::new()),
            publisher,
            metrics: ControllerMetrics::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ScopeState>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limit(&self) -> usize {
        self.config.get().max_concurrent_runs
    }

    fn record_occupancy(&self, scope: &str, state: &ScopeState) {
        self.metrics
            .set_scope_occupancy(scope, state.running.len(), state.pending.len());
    }

    /// Admits a pending run if its scope has a free slot, otherwise queues it.
    ///
    /// Entries held under the run's key by a replaced object are dropped first.
    ///
    /// # Errors
    ///
    /// Returns an error if the run's key is invalid or the store write fails.
    /// A failed write releases the reservation and keeps the run's queue place.
    #[tracing::instrument(skip(self, run), fields(run = %run.metadata.name))]
    pub async fn try_admit(&self, run: &WorkflowRun) -> Result<Admission> {
        let key = run.key()?;
        let uid = run.metadata.uid;
        let scope = key.scope().to_string();
        let limit = self.limit();

        let reservation = {
            let mut scopes = self.lock();
            let state = scopes.entry(scope.clone()).or_default();
            if state.evict_replaced(&key, uid) {
                info!(run = %key, "dropped admission entry of a replaced run");
            }
            let reservation = if state.running.contains_key(&key) {
                Reservation::Running
            } else if let Some(position) = state.position(&key) {
                if position == 1 && state.running.len() < limit {
                    state.pending.pop_front();
                    state.running.insert(key.clone(), uid);
                    Reservation::Reserved { from_pending: true }
                } else {
                    Reservation::Queued(position)
                }
            } else if state.running.len() < limit && state.pending.is_empty() {
                state.running.insert(key.clone(), uid);
                Reservation::Reserved {
                    from_pending: false,
                }
            } else {
                state.pending.push_back((key.clone(), uid));
                Reservation::Queued(state.pending.len())
            };
            self.record_occupancy(&scope, state);
            reservation
        };

        let decision = match reservation {
            Reservation::Running => Admission::AlreadyRunning,
            Reservation::Queued(position) => {
                debug!(scope = %scope, position, limit, "no free slot, run stays pending");
                Admission::Queued { position }
            }
            Reservation::Reserved { from_pending } => {
                match self.start_reserved(&key, uid).await {
                    Ok(decision) => decision,
                    Err(err) => {
                        self.unreserve(&key, uid, from_pending);
                        return Err(err);
                    }
                }
            }
        };
        self.metrics.record_admission(decision.as_str());

        if self.has_free_capacity(&scope) {
            self.promote(&scope).await;
        }
        Ok(decision)
    }

    /// Moves a reserved run to `Running`, rolling the slot back if the run moved on.
    async fn start_reserved(&self, key: &ResourceKey, uid: Option<ObjectUid>) -> Result<Admission> {
        let transition =
            PhaseTransition::new(Phase::Pending, Phase::Running, RunReason::Admitted, Utc::now())
                .for_uid(uid);
        match cas_phase(self.store.as_ref(), key, &transition, |_| {}).await? {
            CasResult::Success => {
                info!(run = %key, "run admitted");
                self.publish_admitted(key).await;
                Ok(Admission::Admitted)
            }
            CasResult::PhaseMismatch {
                actual: Phase::Running,
            } => Ok(Admission::AlreadyRunning),
            CasResult::PhaseMismatch { .. } | CasResult::NotFound => {
                debug!(run = %key, "run left pending before admission, releasing slot");
                self.unreserve(key, uid, false);
                Ok(Admission::Stale)
            }
        }
    }

    async fn publish_admitted(&self, key: &ResourceKey) {
        match self.store.get(key).await {
            Ok(Some(run)) => self.publisher.publish(RunEvent::from_run(&run, Utc::now())),
            Ok(None) => {}
            Err(err) => warn!(run = %key, error = %err, "could not read admitted run for event"),
        }
    }

    fn unreserve(&self, key: &ResourceKey, uid: Option<ObjectUid>, requeue_front: bool) {
        let mut scopes = self.lock();
        if let Some(state) = scopes.get_mut(key.scope()) {
            if state.running.get(key) == Some(&uid) {
                state.running.remove(key);
            }
            if requeue_front && state.position(key).is_none() {
                state.pending.push_front((key.clone(), uid));
            }
            self.record_occupancy(key.scope(), state);
        }
    }

    fn has_free_capacity(&self, scope: &str) -> bool {
        let limit = self.limit();
        self.lock()
            .get(scope)
            .is_some_and(|state| state.running.len() < limit && !state.pending.is_empty())
    }

    /// Fills free slots of `scope` from its pending FIFO, oldest first.
    async fn promote(&self, scope: &str) {
        loop {
            let (key, uid) = {
                let limit = self.limit();
                let mut scopes = self.lock();
                let Some(state) = scopes.get_mut(scope) else {
                    return;
                };
                if state.running.len() >= limit {
                    return;
                }
                let Some((key, uid)) = state.pending.pop_front() else {
                    return;
                };
                state.running.insert(key.clone(), uid);
                self.record_occupancy(scope, state);
                (key, uid)
            };

            match self.start_reserved(&key, uid).await {
                Ok(Admission::Admitted) => {
                    self.metrics.record_admission("promoted");
                    info!(scope, run = %key, "pending run promoted");
                }
                Ok(Admission::Stale) => {
                    debug!(scope, run = %key, "skipping pending run that is no longer pending");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(scope, run = %key, error = %err, "promotion failed, run keeps its place");
                    self.unreserve(&key, uid, true);
                    return;
                }
            }
        }
    }

    /// Releases the slot (or queue place) held under `key` once its run reached
    /// a terminal phase.
    ///
    /// When a slot is freed, the oldest still-pending run of the scope is admitted.
    /// Releasing a key that holds nothing is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, key: &ResourceKey) {
        self.remove_and_promote(key, |_| true).await;
    }

    /// Fills free slots in every scope, e.g. after the limit was raised.
    pub async fn rebalance(&self) {
        let scopes: Vec<String> = self.lock().keys().cloned().collect();
        for scope in scopes {
            if self.has_free_capacity(&scope) {
                self.promote(&scope).await;
            }
        }
    }

    /// Drops all bookkeeping for a deleted run, freeing its slot if it held one.
    ///
    /// Entries created by a newer object under the same key are kept.
    #[tracing::instrument(skip(self))]
    pub async fn forget(&self, key: &ResourceKey, uid: Option<ObjectUid>) {
        self.remove_and_promote(key, |held| held == uid).await;
    }

    async fn remove_and_promote<F>(&self, key: &ResourceKey, matches: F)
    where
        F: Fn(Option<ObjectUid>) -> bool,
    {
        let freed = {
            let mut scopes = self.lock();
            let Some(state) = scopes.get_mut(key.scope()) else {
                return;
            };
            let freed = state.remove(key, matches);
            self.record_occupancy(key.scope(), state);
            freed
        };
        if freed {
            debug!(run = %key, "slot released");
            self.promote(key.scope()).await;
        }
    }

    /// Records a run that is already `Running`, e.g. after a controller restart.
    ///
    /// Returns true if the run was not tracked before.
    pub fn track_running(&self, key: &ResourceKey, uid: Option<ObjectUid>) -> bool {
        let mut scopes = self.lock();
        let state = scopes.entry(key.scope().to_string()).or_default();
        state.remove(key, |held| held != uid);
        state.pending.retain(|(k, _)| k != key);
        let added = state.running.insert(key.clone(), uid).is_none();
        self.record_occupancy(key.scope(), state);
        added
    }

    /// Returns the number of runs holding a slot in `scope`.
    #[must_use]
    pub fn running_count(&self, scope: &str) -> usize {
        self.lock().get(scope).map_or(0, |state| state.running.len())
    }

    /// Returns the number of runs waiting in `scope`.
    #[must_use]
    pub fn pending_count(&self, scope: &str) -> usize {
        self.lock().get(scope).map_or(0, |state| state.pending.len())
    }

    /// Returns the 1-based queue position of a waiting run.
    #[must_use]
    pub fn position(&self, key: &ResourceKey) -> Option<usize> {
        self.lock().get(key.scope()).and_then(|state| state.position(key))
    }

    /// Returns true if the run holds a slot.
    #[must_use]
    pub fn is_running(&self, key: &ResourceKey) -> bool {
        self.lock()
            .get(key.scope())
            .is_some_and(|state| state.running.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::store::InMemoryStore;

    struct Fixture {
        store: Arc<InMemoryStore<WorkflowRun>>,
        config: SharedConfig,
        admission: AdmissionController,
    }

    fn fixture(limit: usize) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let config = SharedConfig::new(ControllerConfig {
            max_concurrent_runs: limit,
            ..ControllerConfig::default()
        });
        let admission = AdmissionController::new(store.clone(), config.clone(), EventPublisher::disabled());
        Fixture {
            store,
            config,
            admission,
        }
    }

    async fn pending(store: &InMemoryStore<WorkflowRun>, name: &str) -> WorkflowRun {
        store
            .create(WorkflowRun::new("ci", name, "backend"))
            .await
            .unwrap()
    }

    async fn phase(store: &InMemoryStore<WorkflowRun>, run: &WorkflowRun) -> Phase {
        store
            .get(&run.key().unwrap())
            .await
            .unwrap()
            .unwrap()
            .phase()
    }

    #[tokio::test]
    async fn admits_until_limit_then_queues() {
        let f = fixture(2);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        let c = pending(&f.store, "c").await;

        assert_eq!(f.admission.try_admit(&a).await.unwrap(), Admission::Admitted);
        assert_eq!(f.admission.try_admit(&b).await.unwrap(), Admission::Admitted);
        assert_eq!(
            f.admission.try_admit(&c).await.unwrap(),
            Admission::Queued { position: 1 }
        );
        assert_eq!(phase(&f.store, &c).await, Phase::Pending);
        assert_eq!(f.admission.running_count("ci"), 2);
        assert_eq!(f.admission.pending_count("ci"), 1);
    }

    #[tokio::test]
    async fn readmission_is_idempotent() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;

        f.admission.try_admit(&a).await.unwrap();
        assert_eq!(f.admission.try_admit(&a).await.unwrap(), Admission::AlreadyRunning);
        f.admission.try_admit(&b).await.unwrap();
        assert_eq!(
            f.admission.try_admit(&b).await.unwrap(),
            Admission::Queued { position: 1 }
        );
        assert_eq!(f.admission.pending_count("ci"), 1);
    }

    #[tokio::test]
    async fn release_promotes_oldest_pending() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        let c = pending(&f.store, "c").await;
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();
        f.admission.try_admit(&c).await.unwrap();

        f.admission.release(&a.key().unwrap()).await;

        assert_eq!(phase(&f.store, &b).await, Phase::Running);
        assert_eq!(phase(&f.store, &c).await, Phase::Pending);
        assert_eq!(f.admission.position(&c.key().unwrap()), Some(1));
        assert!(f.admission.is_running(&b.key().unwrap()));
    }

    #[tokio::test]
    async fn release_of_untracked_run_is_noop() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();

        f.admission
            .release(&ResourceKey::new("ci", "stranger").unwrap())
            .await;
        assert_eq!(phase(&f.store, &b).await, Phase::Pending);
        assert_eq!(f.admission.running_count("ci"), 1);
    }

    #[tokio::test]
    async fn releasing_a_pending_run_frees_no_slot() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        let c = pending(&f.store, "c").await;
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();
        f.admission.try_admit(&c).await.unwrap();

        f.admission.forget(&b.key().unwrap(), b.metadata.uid).await;
        assert_eq!(f.admission.running_count("ci"), 1);
        assert_eq!(f.admission.position(&c.key().unwrap()), Some(1));
        assert_eq!(phase(&f.store, &c).await, Phase::Pending);
    }

    #[tokio::test]
    async fn promotion_skips_runs_no_longer_pending() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        let c = pending(&f.store, "c").await;
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();
        f.admission.try_admit(&c).await.unwrap();

        let mut cancelled = f.store.get(&b.key().unwrap()).await.unwrap().unwrap();
        cancelled
            .transition_to(Phase::Cancelled, RunReason::Cancelled, None, Utc::now())
            .unwrap();
        f.store.update(cancelled).await.unwrap();

        f.admission.release(&a.key().unwrap()).await;
        assert_eq!(phase(&f.store, &b).await, Phase::Cancelled);
        assert_eq!(phase(&f.store, &c).await, Phase::Running);
        assert_eq!(f.admission.running_count("ci"), 1);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let other = f
            .store
            .create(WorkflowRun::new("prod", "a", "backend"))
            .await
            .unwrap();
        assert_eq!(f.admission.try_admit(&a).await.unwrap(), Admission::Admitted);
        assert_eq!(f.admission.try_admit(&other).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    async fn stale_run_releases_its_reservation() {
        let f = fixture(1);
        let ghost = WorkflowRun::new("ci", "ghost", "backend");
        assert_eq!(f.admission.try_admit(&ghost).await.unwrap(), Admission::Stale);
        assert_eq!(f.admission.running_count("ci"), 0);
    }

    #[tokio::test]
    async fn store_failure_rolls_back_and_keeps_place() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        f.store.fail_next_updates(1).unwrap();
        assert!(f.admission.try_admit(&a).await.is_err());
        assert_eq!(f.admission.running_count("ci"), 0);

        assert_eq!(f.admission.try_admit(&a).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    async fn track_running_rebuilds_state() {
        let f = fixture(1);
        let key = ResourceKey::new("ci", "survivor").unwrap();
        assert!(f.admission.track_running(&key, None));
        assert!(!f.admission.track_running(&key, None));

        let b = pending(&f.store, "b").await;
        assert_eq!(
            f.admission.try_admit(&b).await.unwrap(),
            Admission::Queued { position: 1 }
        );
    }

    #[tokio::test]
    async fn raised_limit_admits_waiting_runs() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        let c = pending(&f.store, "c").await;
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();
        f.admission.try_admit(&c).await.unwrap();

        f.config.replace(ControllerConfig {
            max_concurrent_runs: 3,
            ..ControllerConfig::default()
        });
        let b = f.store.get(&b.key().unwrap()).await.unwrap().unwrap();
        assert_eq!(f.admission.try_admit(&b).await.unwrap(), Admission::Admitted);
        assert_eq!(phase(&f.store, &c).await, Phase::Running);
        assert_eq!(f.admission.running_count("ci"), 3);
    }

    #[tokio::test]
    async fn rebalance_fills_raised_capacity() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();

        f.admission.rebalance().await;
        assert_eq!(phase(&f.store, &b).await, Phase::Pending);

        f.config.replace(ControllerConfig {
            max_concurrent_runs: 2,
            ..ControllerConfig::default()
        });
        f.admission.rebalance().await;
        assert_eq!(phase(&f.store, &b).await, Phase::Running);
    }

    async fn recreate(store: &InMemoryStore<WorkflowRun>, run: &WorkflowRun) -> WorkflowRun {
        store.delete(&run.key().unwrap()).await.unwrap();
        pending(store, &run.metadata.name).await
    }

    #[tokio::test]
    async fn recreated_run_takes_over_the_slot_of_its_predecessor() {
        let f = fixture(1);
        let old = pending(&f.store, "a").await;
        f.admission.try_admit(&old).await.unwrap();

        let new = recreate(&f.store, &old).await;
        assert_ne!(new.metadata.uid, old.metadata.uid);

        assert_eq!(f.admission.try_admit(&new).await.unwrap(), Admission::Admitted);
        assert_eq!(phase(&f.store, &new).await, Phase::Running);
        assert_eq!(f.admission.running_count("ci"), 1);
        assert_eq!(f.admission.pending_count("ci"), 0);
    }

    #[tokio::test]
    async fn recreated_run_replaces_its_queue_entry() {
        let f = fixture(1);
        let a = pending(&f.store, "a").await;
        let b = pending(&f.store, "b").await;
        let c = pending(&f.store, "c").await;
        f.admission.try_admit(&a).await.unwrap();
        f.admission.try_admit(&b).await.unwrap();
        f.admission.try_admit(&c).await.unwrap();

        let b = recreate(&f.store, &b).await;
        assert_eq!(
            f.admission.try_admit(&b).await.unwrap(),
            Admission::Queued { position: 2 }
        );
        assert_eq!(f.admission.pending_count("ci"), 2);

        f.admission.release(&a.key().unwrap()).await;
        assert_eq!(phase(&f.store, &c).await, Phase::Running);
        assert_eq!(phase(&f.store, &b).await, Phase::Pending);
    }

    #[tokio::test]
    async fn forgetting_a_replaced_run_keeps_its_successor() {
        let f = fixture(1);
        let old = pending(&f.store, "a").await;
        f.admission.try_admit(&old).await.unwrap();
        let new = recreate(&f.store, &old).await;
        f.admission.try_admit(&new).await.unwrap();

        f.admission.forget(&old.key().unwrap(), old.metadata.uid).await;
        assert!(f.admission.is_running(&new.key().unwrap()));
        assert_eq!(f.admission.running_count("ci"), 1);
    }

    #[tokio::test]
    async fn track_running_replaces_a_stale_entry() {
        let f = fixture(2);
        let old = pending(&f.store, "a").await;
        f.admission.try_admit(&old).await.unwrap();
        let mut new = recreate(&f.store, &old).await;
        new.transition_to(Phase::Running, RunReason::Admitted, None, Utc::now())
            .unwrap();
        let new = f.store.update(new).await.unwrap();

        assert!(f.admission.track_running(&new.key().unwrap(), new.metadata.uid));
        assert!(!f.admission.track_running(&new.key().unwrap(), new.metadata.uid));
        assert_eq!(f.admission.running_count("ci"), 1);
    }
}
