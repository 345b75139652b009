//! # realmkit testkit
//!
//! Test utilities for realmkit.
//!
//! This crate provides:
//! - Temporary realm directories and sample schemas
//! - Property-based generators using proptest
//! - A recording [`RealmDelegate`](realmkit_core::RealmDelegate)
//! - Multi-thread stress helpers
//! - Tracing setup for tests
//!
//! The cross-crate integration tests live under `tests/`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use realmkit_testkit::prelude::*;
//!
//! #[test]
//! fn opens() {
//!     let dir = TestRealmDir::new();
//!     let realm = dir.open(dir.config("a").schema(person_schema_v1(), 1)).unwrap();
//!     assert_eq!(realm.schema_version().number(), Some(1));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod recorder;
pub mod stress;

use std::sync::Once;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::recorder::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use recorder::*;
pub use stress::*;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
