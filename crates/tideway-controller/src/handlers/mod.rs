//! Handlers for the kinds the controller process watches.
//!
//! | Kind | Handler | Reacts by |
//! |------|---------|-----------|
//! | `WorkflowRun` | [`WorkflowRunHandler`] | admitting, tracking and releasing runs |
//! | `Pod` | [`PodHandler`] | projecting stage state onto the owning run |
//! | `ConfigMap` | [`ConfigMapHandler`] | hot-swapping the controller config |
//!
//! Every handler is idempotent and level-triggered: it reads the object it is
//! given and converges the store towards it, whatever the event type was.

pub mod config_map;
pub mod pod;
pub mod workflow_run;

pub use config_map::ConfigMapHandler;
pub use pod::PodHandler;
pub use workflow_run::WorkflowRunHandler;
