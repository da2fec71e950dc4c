//! # Datasync Testkit
//!
//! Test utilities for the datasync crates.
//!
//! This crate provides:
//! - Mock stores, store provider, cloud server and network monitor
//! - Property-based test generators using proptest
//! - Tracing initialisation for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use datasync_testkit::prelude::*;
//!
//! #[test]
//! fn syncs_one_store() {
//!     init_tracing();
//!     let provider = MockStoreProvider::new();
//!     let store = provider.add_store(&meta);
//!     // ... drive the component under test
//!     assert_eq!(store.sync_calls().len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
