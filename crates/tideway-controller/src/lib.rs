//! # tideway-controller
//!
//! Level-triggered reconciliation engine for Tideway workflow runs.
//!
//! This crate provides:
//!
//! - **Reconciliation engine**: a generic [`Controller`](controller::Controller)
//!   pairing an informer, a deduplicating [`EventQueue`](queue::EventQueue)
//!   and a [`Handler`](controller::Handler) per watched kind
//! - **Admission control**: a per-namespace cap on concurrently running runs
//! - **Timeouts**: a periodic sweep failing runs past their deadline
//! - **Garbage collection**: retention by age and count, owned objects first
//! - **Event shipping**: best-effort run lifecycle events to a message broker
//!
//! ## Coordination
//!
//! Components never call each other to hand over a run. Every phase change
//! is a compare-and-swap on the stored run ([`store::cas_phase`]); the other
//! components observe the new phase through their watch and react.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tideway_controller::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let cluster = InMemoryCluster::default();
//! let context = ProcessContext::new(
//!     ControllerConfig::default(),
//!     ClusterApis::in_memory(&cluster),
//!     EventPublisher::disabled(),
//! )?;
//! context.start().await?;
//!
//! cluster
//!     .runs
//!     .create(WorkflowRun::new("ci", "build-1", "backend"))
//!     .await?;
//!
//! context.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod gc;
pub mod handlers;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod resource;
pub mod runtime;
pub mod shipping;
pub mod store;
pub mod timeout;
pub mod watch;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::admission::{Admission, AdmissionController};
    pub use crate::config::{ControllerConfig, SharedConfig};
    pub use crate::controller::{Controller, ControllerOptions, ControllerState, Handler};
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::event::{Event, EventType};
    pub use crate::gc::{GcProcessor, GcSummary};
    pub use crate::model::{ConfigMap, Phase, Pod, PodPhase, RunReason, WorkflowRun};
    pub use crate::queue::EventQueue;
    pub use crate::resource::{ObjectMeta, Resource};
    pub use crate::runtime::{ClusterApis, InMemoryCluster, ProcessContext};
    pub use crate::shipping::{EventPublisher, RunEvent};
    pub use crate::store::{CasResult, InMemoryStore, ResourceStore};
    pub use crate::timeout::{SweepSummary, TimeoutProcessor};
}

pub use error::{Error, Result};
