//! Store fixtures.
//!
//! Provides stores with automatic cleanup and helpers for the common
//! setup steps of sync tests.

use bucketsync_protocol::{OplogEntry, SyncDataBatch, SyncDataBucket};
use bucketsync_store::{LocalStore, Row, StoreConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Arc<LocalStore>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory store.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(LocalStore::open_in_memory().expect("Failed to open in-memory store")),
            temp_dir: None,
        }
    }

    /// Creates a new store in a temporary directory.
    pub fn file() -> Self {
        Self::file_with_config(StoreConfig::default().with_sync_on_commit(false))
    }

    /// Creates a new store in a temporary directory with `config`.
    pub fn file_with_config(config: StoreConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = LocalStore::open_with_config(&temp_dir.path().join("store"), config)
            .expect("Failed to open file store");
        Self {
            store: Arc::new(store),
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("store"))
    }

    /// Closes the store and opens the same directory again.
    ///
    /// # Panics
    ///
    /// Panics for in-memory stores or when the store is still shared.
    pub fn reopen(self) -> Self {
        let path = self.path().expect("Only file stores can be reopened");
        let config = self.store.config().clone();
        let store = Arc::try_unwrap(self.store)
            .ok()
            .expect("Store is still shared");
        drop(store);
        Self {
            store: Arc::new(LocalStore::open_with_config(&path, config).expect("Failed to reopen store")),
            temp_dir: self.temp_dir,
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary in-memory store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&LocalStore) -> R,
{
    let store = TestStore::memory();
    f(&store)
}

/// Saves `entries` into `bucket`.
///
/// # Panics
///
/// Panics when the store rejects the data.
pub fn save(store: &LocalStore, bucket: &str, entries: Vec<OplogEntry>) {
    store
        .save_sync_data(&SyncDataBatch::from(SyncDataBucket::new(bucket, entries)))
        .expect("Failed to save sync data");
}

/// Makes one local `put`, queueing one CRUD entry.
///
/// # Panics
///
/// Panics when `values` is not an object or the write fails.
pub fn local_put(store: &LocalStore, table: &str, id: &str, values: Value) {
    let row = as_row(values);
    store
        .write_transaction(|tx| tx.put(table, id, row))
        .expect("Failed to write locally");
}

/// Converts a JSON object into a [`Row`].
///
/// # Panics
///
/// Panics when `value` is not an object.
pub fn as_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("Expected a JSON object, got {other}"),
    }
}

/// Returns one column of a materialized row.
pub fn column(store: &LocalStore, table: &str, id: &str, column: &str) -> Option<Value> {
    store.get(table, id).and_then(|row| row.get(column).cloned())
}

/// Returns true if `path` holds a journal file.
pub fn has_journal(path: &Path) -> bool {
    path.join("journal.bsj").is_file()
}
