//! # bucketsync testkit
//!
//! Test utilities for bucketsync.
//!
//! This crate provides:
//! - Store fixtures, in memory or in a temporary directory
//! - Builders for oplog entries, checkpoints and sync lines
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use bucketsync_testkit::prelude::*;
//!
//! let store = TestStore::memory();
//! let entries = vec![put(1, "assets", "O1", serde_json::json!({"make": "acme"}))];
//! let checkpoint = checkpoint_for(1, &[("b1", &entries)]);
//! save(&store, "b1", entries);
//! assert!(store.sync_local_database(&checkpoint, None).unwrap().ready);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod builders;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builders::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use builders::*;
pub use fixtures::*;
pub use generators::*;
