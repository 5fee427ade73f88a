//! Cluster resource store and phase compare-and-swap.
//!
//! The [`ResourceStore`] trait is the controller's view of the cluster API:
//! keyed CRUD with optimistic concurrency on `resource_version`. Every
//! component that moves a workflow run between phases does it through
//! [`cas_phase`], which re-reads on version conflicts and only applies the
//! transition while the stored phase still equals the expected one.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: admission, timeout and pod projection race on the same
//!   runs; the stored phase decides who wins
//! - **Bounded retry**: version conflicts are retried a fixed number of times,
//!   then surface as a transient error for the worker's backoff
//! - **Testability**: [`memory::InMemoryStore`] doubles as a watch source

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tideway_core::{ObjectUid, ResourceKey};

use crate::error::{Error, Result};
use crate::model::{Phase, RunReason, WorkflowRun};
use crate::resource::Resource;

pub use memory::InMemoryStore;

/// Attempts made by [`cas_phase`] and [`update_with_retry`] before giving up
/// on version conflicts.
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// Keyed CRUD access to one resource kind.
///
/// All methods are `Send + Sync` to support concurrent access from workers
/// and background sweeps.
#[async_trait]
pub trait ResourceStore<T: Resource>: Send + Sync {
    /// Gets an object by key.
    ///
    /// Returns `None` if the object does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<T>>;

    /// Lists every stored object of this kind.
    async fn list(&self) -> Result<Vec<T>>;

    /// Creates an object, assigning its UID and first resource version.
    ///
    /// Fails with [`Error::AlreadyExists`] if the key is taken.
    async fn create(&self, object: T) -> Result<T>;

    /// Replaces an object.
    ///
    /// Fails with [`Error::Conflict`] if the stored `resource_version` differs
    /// from the one carried by `object`, and [`Error::NotFound`] if the object
    /// is gone.
    async fn update(&self, object: T) -> Result<T>;

    /// Deletes an object. Returns false if it did not exist.
    async fn delete(&self, key: &ResourceKey) -> Result<bool>;
}

/// Result of a phase compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The transition was applied.
    Success,
    /// The run does not exist.
    NotFound,
    /// The stored phase did not match the expected phase.
    PhaseMismatch {
        /// The phase that was found.
        actual: Phase,
    },
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the run was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// A conditional phase transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    /// Phase the run must currently be in.
    pub expected: Phase,
    /// Phase to move to.
    pub target: Phase,
    /// Reason recorded on the run.
    pub reason: RunReason,
    /// Optional detail recorded on the run.
    pub message: Option<String>,
    /// Time used for `started_at` / `completed_at` stamps.
    pub at: DateTime<Utc>,
    /// When set, only the run with this UID may be transitioned.
    pub uid: Option<ObjectUid>,
}

impl PhaseTransition {
    /// Creates a transition stamped at `at`.
    #[must_use]
    pub const fn new(expected: Phase, target: Phase, reason: RunReason, at: DateTime<Utc>) -> Self {
        Self {
            expected,
            target,
            reason,
            message: None,
            at,
            uid: None,
        }
    }

    /// Restricts the transition to the run with `uid`.
    ///
    /// A run recreated under the same key is then reported as
    /// [`CasResult::NotFound`].
    #[must_use]
    pub fn for_uid(mut self, uid: Option<ObjectUid>) -> Self {
        self.uid = uid;
        self
    }

    /// Attaches a detail message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Atomically moves a run between phases if its stored phase still matches.
///
/// `mutate` runs on the transitioned copy before it is written and may edit
/// other status fields in the same write.
///
/// # Returns
///
/// - `CasResult::Success` if the transition was written
/// - `CasResult::NotFound` if the run doesn't exist
/// - `CasResult::PhaseMismatch` if another writer moved the run first
///
/// # Errors
///
/// Returns an error if the store fails, or [`Error::Conflict`] if every
/// attempt lost a version race.
#[tracing::instrument(skip(store, transition, mutate), fields(expected = %transition.expected, target = %transition.target))]
pub async fn cas_phase<S, F>(
    store: &S,
    key: &ResourceKey,
    transition: &PhaseTransition,
    mutate: F,
) -> Result<CasResult>
where
    S: ResourceStore<WorkflowRun> + ?Sized,
    F: Fn(&mut WorkflowRun) + Send + Sync,
{
    let mut last_conflict = None;
    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some(current) = store.get(key).await? else {
            return Ok(CasResult::NotFound);
        };
        if transition.uid.is_some() && current.metadata.uid != transition.uid {
            return Ok(CasResult::NotFound);
        }
        if current.phase() != transition.expected {
            return Ok(CasResult::PhaseMismatch {
                actual: current.phase(),
            });
        }

        let mut next = current;
        next.transition_to(
            transition.target,
            transition.reason,
            transition.message.clone(),
            transition.at,
        )?;
        mutate(&mut next);

        match store.update(next).await {
            Ok(_) => return Ok(CasResult::Success),
            Err(err) if err.is_conflict() => {
                tracing::debug!(key = %key, "phase write lost a version race, retrying");
                last_conflict = Some(err);
            }
            Err(err) if err.is_not_found() => return Ok(CasResult::NotFound),
            Err(err) => return Err(err),
        }
    }
    Err(last_conflict.unwrap_or_else(|| Error::storage("conflict retries exhausted")))
}

/// Applies a non-phase edit, retrying on version conflicts.
///
/// `mutate` returns false when the object already has the desired state, in
/// which case nothing is written. Returns the stored object, or `None` if it
/// does not exist.
///
/// # Errors
///
/// Returns an error if the store fails or every attempt lost a version race.
pub async fn update_with_retry<T, S, F>(store: &S, key: &ResourceKey, mutate: F) -> Result<Option<T>>
where
    T: Resource,
    S: ResourceStore<T> + ?Sized,
    F: Fn(&mut T) -> bool + Send + Sync,
{
    let mut last_conflict = None;
    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some(mut object) = store.get(key).await? else {
            return Ok(None);
        };
        if !mutate(&mut object) {
            return Ok(Some(object));
        }
        match store.update(object).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(err) if err.is_conflict() => last_conflict = Some(err),
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        }
    }
    Err(last_conflict.unwrap_or_else(|| Error::storage("conflict retries exhausted")))
}
