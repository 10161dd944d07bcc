//! # bucketsync store
//!
//! Durable client-side state for bucket-oriented sync.
//!
//! This crate provides:
//! - [`LocalStore`], a journaled table store with single-writer transactions
//! - the bucket storage engine: saving downloaded oplog entries, checksum
//!   validation, checkpoint merge, bucket removal and compaction
//! - the CRUD upload queue and its write-checkpoint fence
//! - [`LocalTxn`] for application writes that feed the queue
//!
//! ## Layout
//!
//! ```text
//! <dir>/LOCK           advisory lock held while open
//! <dir>/journal.bsj    commit and snapshot records
//! <dir>/locks/         named locks shared with other processes
//! ```
//!
//! ## Example
//!
//! ```rust
//! use bucketsync_protocol::{BucketChecksum, Checkpoint, OplogEntry, SyncDataBatch, SyncDataBucket};
//! use bucketsync_store::LocalStore;
//!
//! let store = LocalStore::open_in_memory().unwrap();
//! let data = SyncDataBucket::new(
//!     "bucket1",
//!     vec![OplogEntry::put(1, "assets", "O1", r#"{"description":"bar"}"#, 1)],
//! );
//! store.save_sync_data(&SyncDataBatch::from(data)).unwrap();
//!
//! let checkpoint = Checkpoint::new(1, vec![BucketChecksum::new("bucket1", 1)]);
//! let result = store.sync_local_database(&checkpoint, None).unwrap();
//! assert!(result.ready);
//! assert_eq!(store.get("assets", "O1").unwrap()["description"], "bar");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod bucket_storage;
mod config;
mod crud;
mod error;
mod journal;
mod local;
mod store;
mod tables;

pub use backend::{FileBackend, InMemoryBackend, JournalBackend};
pub use bucket_storage::{
    BucketOperationProgress, BucketState, BucketStorageAdapter, SyncLocalResult,
};
pub use config::StoreConfig;
pub use crud::{CrudBatch, CrudTransaction, UploadQueueStats};
pub use error::{StoreError, StoreResult};
pub use journal::{
    compute_crc32, scan_journal, JournalScan, RecordKind, JOURNAL_MAGIC, JOURNAL_VERSION,
};
pub use local::LocalTxn;
pub use store::{LocalStore, LOCAL_BUCKET};
pub use tables::{BucketRecord, Meta, Row, StoredOp, Tables};
