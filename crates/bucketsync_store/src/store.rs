//! The local store: directory handling, journal, tables and write transactions.
//!
//! ```text
//! <dir>/
//! ├─ LOCK          # Advisory lock, one opener at a time
//! ├─ journal.bsj   # Commit and snapshot records
//! └─ locks/        # Named sync/crud locks shared across processes
//! ```
//!
//! All writes go through [`LocalStore::transact`], which holds the single
//! writer lock, applies mutations to the tables, and either appends them to
//! the journal as one commit record or undoes them.

use crate::backend::{FileBackend, InMemoryBackend, JournalBackend};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, JournalScan};
use crate::tables::{BucketRecord, Meta, Mutation, Row, StoredOp, Tables};
use bucketsync_protocol::{Checkpoint, CrudEntry, OpId, RowKey};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.bsj";
const LOCKS_DIR: &str = "locks";

/// Name of the synthetic bucket that tracks local writes.
pub const LOCAL_BUCKET: &str = "$local";

pub(crate) struct CompactionState {
    /// Entries saved since the last superseded-entry sweep.
    pub(crate) counter: u64,
    /// Tombstone buckets may be ready for deletion.
    pub(crate) pending_deletes: bool,
}

struct StoreInner {
    config: StoreConfig,
    path: Option<PathBuf>,
    _lock_file: Option<File>,
    journal: Mutex<Journal>,
    tables: RwLock<Tables>,
    crud_seq: watch::Sender<u64>,
    compaction: Mutex<CompactionState>,
    target: Mutex<Option<Checkpoint>>,
    completed_sync: AtomicBool,
    closed: AtomicBool,
    open_scan: JournalScan,
}

/// A journaled local store holding bucket data, materialized rows and the
/// CRUD queue.
///
/// `LocalStore` is cheap to clone; clones share the same state.
///
/// # Example
///
/// ```rust
/// use bucketsync_store::LocalStore;
/// use serde_json::json;
///
/// let store = LocalStore::open_in_memory().unwrap();
/// store
///     .write_transaction(|tx| {
///         let row = json!({"description": "laptop"}).as_object().cloned().unwrap();
///         tx.put("assets", "A1", row)
///     })
///     .unwrap();
/// assert!(store.get("assets", "A1").is_some());
/// ```
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.inner.path)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens or creates a store directory with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process has the directory
    /// open, or an I/O error.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process has the directory
    /// open, or an I/O error.
    pub fn open_with_config(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(StoreError::corrupted(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }
        fs::create_dir_all(path.join(LOCKS_DIR))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        let backend = FileBackend::open(&path.join(JOURNAL_FILE))?;
        Self::build(Box::new(backend), config, Some(path.to_path_buf()), Some(lock_file))
    }

    /// Opens an empty in-memory store.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the on-disk variant.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open_in_memory_with_config(StoreConfig::default())
    }

    /// Opens an empty in-memory store with the given configuration.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the on-disk variant.
    pub fn open_in_memory_with_config(config: StoreConfig) -> StoreResult<Self> {
        Self::build(Box::new(InMemoryBackend::new()), config, None, None)
    }

    /// Opens a store over an arbitrary journal backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or truncated.
    pub fn with_backend(backend: Box<dyn JournalBackend>, config: StoreConfig) -> StoreResult<Self> {
        Self::build(backend, config, None, None)
    }

    fn build(
        backend: Box<dyn JournalBackend>,
        config: StoreConfig,
        path: Option<PathBuf>,
        lock_file: Option<File>,
    ) -> StoreResult<Self> {
        let (journal, tables, open_scan) = Journal::open(backend, config.sync_on_commit)?;
        let (crud_seq, _) = watch::channel(tables.meta().crud_seq);
        let completed = tables
            .buckets()
            .any(|(_, record)| record.last_applied_op > OpId::ZERO);

        tracing::debug!(
            commits = open_scan.commits,
            snapshots = open_scan.snapshots,
            buckets = tables.buckets().count(),
            rows = tables.row_count(),
            "store opened"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                compaction: Mutex::new(CompactionState {
                    // The first sweep runs right after startup.
                    counter: config.compact_interval,
                    pending_deletes: true,
                }),
                config,
                path,
                _lock_file: lock_file,
                journal: Mutex::new(journal),
                tables: RwLock::new(tables),
                crud_seq,
                target: Mutex::new(None),
                completed_sync: AtomicBool::new(completed),
                closed: AtomicBool::new(false),
                open_scan,
            }),
        })
    }

    /// Returns the store directory, if on disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Returns the directory for cross-process named locks, if on disk.
    #[must_use]
    pub fn locks_dir(&self) -> Option<PathBuf> {
        self.inner.path.as_ref().map(|p| p.join(LOCKS_DIR))
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns what journal replay found when the store was opened.
    #[must_use]
    pub fn open_scan(&self) -> &JournalScan {
        &self.inner.open_scan
    }

    /// Runs `f` against a consistent view of the tables.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.inner.tables.read())
    }

    /// Returns a materialized row.
    #[must_use]
    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.read(|t| t.row(table, id).cloned())
    }

    /// Returns every materialized row of a table, ordered by id.
    #[must_use]
    pub fn get_all(&self, table: &str) -> Vec<Row> {
        self.read(|t| t.rows(table).map(|(_, row)| row.clone()).collect())
    }

    /// Subscribes to CRUD sequence changes.
    ///
    /// The channel publishes the latest CRUD id after every commit that
    /// queued a local write.
    #[must_use]
    pub fn subscribe_crud(&self) -> watch::Receiver<u64> {
        self.inner.crud_seq.subscribe()
    }

    /// Rewrites the journal as a single snapshot record.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn snapshot(&self) -> StoreResult<()> {
        self.ensure_open()?;
        let mut journal = self.inner.journal.lock();
        let tables = self.inner.tables.read();
        journal.write_snapshot(&tables)
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn journal_size(&self) -> StoreResult<u64> {
        self.inner.journal.lock().size()
    }

    /// Closes the store. Later writes fail with [`StoreError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`LocalStore::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Returns the persistent client id, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if a new id cannot be persisted.
    pub fn client_id(&self) -> StoreResult<String> {
        if let Some(id) = self.read(|t| t.meta().client_id.clone()) {
            return Ok(id);
        }
        self.transact(|txn| {
            if let Some(id) = txn.tables().meta().client_id.clone() {
                return Ok(id);
            }
            let id = uuid::Uuid::new_v4().to_string();
            let mut meta = txn.tables().meta().clone();
            meta.client_id = Some(id.clone());
            txn.set_meta(meta);
            Ok(id)
        })
    }

    /// Runs `f` as one atomic write transaction.
    ///
    /// On success the mutations are committed to the journal. If `f` or the
    /// journal append fails, every mutation is undone.
    pub(crate) fn transact<R>(
        &self,
        f: impl FnOnce(&mut WriteTxn<'_>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.ensure_open()?;
        let mut journal = self.inner.journal.lock();
        let mut tables = self.inner.tables.write();

        let mut txn = WriteTxn::new(&mut *tables);
        let value = match f(&mut txn) {
            Ok(value) => value,
            Err(err) => {
                txn.rollback();
                return Err(err);
            }
        };
        if txn.redo.is_empty() {
            return Ok(value);
        }
        if let Err(err) = journal.append_commit(&txn.redo) {
            tracing::error!(error = %err, "journal append failed, rolling back");
            txn.rollback();
            return Err(err);
        }
        drop(txn);

        let seq = tables.meta().crud_seq;
        match journal.size() {
            Ok(size) if size > self.inner.config.snapshot_threshold => {
                if let Err(err) = journal.write_snapshot(&tables) {
                    tracing::warn!(error = %err, "journal snapshot failed");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "could not read journal size"),
        }
        drop(tables);
        drop(journal);

        self.inner.crud_seq.send_if_modified(|current| {
            if *current == seq {
                false
            } else {
                *current = seq;
                true
            }
        });
        Ok(value)
    }

    pub(crate) fn compaction(&self) -> parking_lot::MutexGuard<'_, CompactionState> {
        self.inner.compaction.lock()
    }

    pub(crate) fn set_target(&self, checkpoint: Option<Checkpoint>) {
        *self.inner.target.lock() = checkpoint;
    }

    /// Returns the checkpoint most recently recorded as the sync target.
    #[must_use]
    pub fn target_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.target.lock().clone()
    }

    pub(crate) fn completed_sync_flag(&self) -> &AtomicBool {
        &self.inner.completed_sync
    }
}

/// An open write transaction.
pub(crate) struct WriteTxn<'a> {
    tables: &'a mut Tables,
    redo: Vec<Mutation>,
    undo: Vec<Mutation>,
}

impl<'a> WriteTxn<'a> {
    fn new(tables: &'a mut Tables) -> Self {
        Self {
            tables,
            redo: Vec::new(),
            undo: Vec::new(),
        }
    }

    pub(crate) fn tables(&self) -> &Tables {
        &*self.tables
    }

    fn apply(&mut self, mutation: Mutation) {
        let inverse = self.tables.apply(mutation.clone());
        self.redo.push(mutation);
        self.undo.push(inverse);
    }

    fn rollback(&mut self) {
        while let Some(inverse) = self.undo.pop() {
            self.tables.apply(inverse);
        }
        self.redo.clear();
    }

    pub(crate) fn set_bucket(&mut self, name: &str, value: Option<BucketRecord>) {
        if self.tables.bucket(name) != value.as_ref() {
            self.apply(Mutation::SetBucket {
                name: name.to_string(),
                value,
            });
        }
    }

    /// Updates an existing bucket in place. Missing buckets are left alone.
    pub(crate) fn update_bucket(&mut self, name: &str, f: impl FnOnce(&mut BucketRecord)) {
        if let Some(mut record) = self.tables.bucket(name).cloned() {
            f(&mut record);
            self.set_bucket(name, Some(record));
        }
    }

    pub(crate) fn set_op(&mut self, bucket: &str, op_id: OpId, value: Option<StoredOp>) {
        self.apply(Mutation::SetOp {
            bucket: bucket.to_string(),
            op_id,
            value,
        });
    }

    pub(crate) fn set_row(&mut self, table: &str, id: &str, value: Option<Row>) {
        if self.tables.row(table, id) != value.as_ref() {
            self.apply(Mutation::SetRow {
                table: table.to_string(),
                id: id.to_string(),
                value,
            });
        }
    }

    pub(crate) fn set_crud(&mut self, id: u64, value: Option<CrudEntry>) {
        self.apply(Mutation::SetCrud { id, value });
    }

    pub(crate) fn mark_updated(&mut self, key: RowKey) {
        if !self.tables.updated_rows().contains(&key) {
            self.apply(Mutation::SetUpdated { key, present: true });
        }
    }

    pub(crate) fn unmark_updated(&mut self, key: RowKey) {
        if self.tables.updated_rows().contains(&key) {
            self.apply(Mutation::SetUpdated {
                key,
                present: false,
            });
        }
    }

    pub(crate) fn set_meta(&mut self, meta: Meta) {
        if self.tables.meta() != &meta {
            self.apply(Mutation::SetMeta(meta));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let store = LocalStore::open_in_memory().unwrap();
        let result: StoreResult<()> = store.transact(|txn| {
            txn.set_bucket("b", Some(BucketRecord::default()));
            Err(StoreError::corrupted("boom"))
        });
        assert!(result.is_err());
        assert!(store.read(|t| t.bucket("b").is_none()));
        assert_eq!(store.journal_size().unwrap(), 0);
    }

    #[test]
    fn empty_transaction_writes_nothing() {
        let store = LocalStore::open_in_memory().unwrap();
        store.transact(|_| Ok(())).unwrap();
        assert_eq!(store.journal_size().unwrap(), 0);
    }

    #[test]
    fn second_opener_is_locked_out() {
        let dir = tempdir().unwrap();
        let _first = LocalStore::open(dir.path()).unwrap();
        assert!(matches!(
            LocalStore::open(dir.path()),
            Err(StoreError::Locked)
        ));
        assert!(dir.path().join("locks").is_dir());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let client_id = {
            let store = LocalStore::open(dir.path()).unwrap();
            store
                .transact(|txn| {
                    txn.set_bucket(
                        "b",
                        Some(BucketRecord {
                            last_op: OpId::new(5),
                            ..BucketRecord::default()
                        }),
                    );
                    Ok(())
                })
                .unwrap();
            store.client_id().unwrap()
        };

        let store = LocalStore::open(dir.path()).unwrap();
        assert_eq!(store.read(|t| t.bucket("b").unwrap().last_op), OpId::new(5));
        assert_eq!(store.client_id().unwrap(), client_id);
        assert_eq!(store.open_scan().commits, 2);
    }

    #[test]
    fn snapshot_threshold_compacts_journal() {
        let config = StoreConfig::new().with_snapshot_threshold(64);
        let store = LocalStore::open_in_memory_with_config(config).unwrap();
        for i in 0..20u64 {
            store
                .transact(|txn| {
                    txn.set_bucket(
                        &format!("bucket-{i}"),
                        Some(BucketRecord::default()),
                    );
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(store.read(|t| t.buckets().count()), 20);
    }

    #[test]
    fn closed_store_rejects_writes() {
        let store = LocalStore::open_in_memory().unwrap();
        store.close();
        assert!(matches!(store.client_id(), Err(StoreError::Closed)));
    }
}
