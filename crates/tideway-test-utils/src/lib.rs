//! Shared test utilities for Tideway integration tests.
//!
//! This crate provides:
//! - [`TestContext`]: in-memory cluster stores plus a process context wired to them
//! - [`RunFactory`]: workflow runs in each lifecycle phase
//! - Assertion helpers and [`wait_until`] for watching asynchronous convergence
//!
//! # Example
//!
//! ```rust,ignore
//! use tideway_test_utils::{TestContext, RunFactory, assert_phase};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::started(1).await;
//!     let run = ctx.create_run(RunFactory::pending("ci", "build-1")).await;
//!     // ... drive the scenario ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tideway_controller=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
