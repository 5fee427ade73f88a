//! # tideway-core
//!
//! Core abstractions for the Tideway workflow controller.
//!
//! This crate provides the foundational types shared by all Tideway components:
//!
//! - **Resource Keys**: Namespace-qualified identities used for queueing and lookups
//! - **Identifiers**: Strongly-typed object UIDs referenced by owner links
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use tideway_core::prelude::*;
//!
//! let key: ResourceKey = "ci/build-7".parse().unwrap();
//! assert_eq!(key.scope(), "ci");
//!
//! let uid = ObjectUid::generate();
//! assert!(!uid.to_string().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod key;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::ObjectUid;
    pub use crate::key::{DEFAULT_SCOPE, ResourceKey};
    pub use crate::observability::{LogFormat, init_logging};
}

pub use error::{Error, Result};
pub use id::ObjectUid;
pub use key::{DEFAULT_SCOPE, ResourceKey};
pub use observability::{LogFormat, init_logging};
