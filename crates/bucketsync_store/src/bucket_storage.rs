//! The bucket storage engine.
//!
//! Downloaded oplog entries are saved per bucket without touching the
//! materialized rows. A checkpoint is applied by [`LocalStore::sync_local_database`]:
//! checksums are validated first, then every touched row is re-merged from
//! the live entries of all buckets in a single write transaction.
//!
//! ## Merge rule
//!
//! A row's value is the payload of the highest-op-id live `PUT` for it,
//! across every bucket and subkey. Without one the row is deleted. A `REMOVE`
//! only supersedes entries in its own bucket, so an object removed from one
//! bucket survives while another bucket still holds it.
//!
//! ## Priorities
//!
//! Buckets carry a priority (lower is more urgent). A partial apply at
//! priority `p` publishes only the buckets at `p` or below, before the full
//! checkpoint has arrived.

use crate::crud::{CrudBatch, CrudTransaction, UploadQueueStats};
use crate::error::{StoreError, StoreResult};
use crate::store::{LocalStore, WriteTxn, LOCAL_BUCKET};
use crate::tables::{BucketRecord, StoredOp, Tables};
use bucketsync_protocol::{
    Checkpoint, Checksum, CrudEntry, OpId, OpType, OplogEntry, RowKey, SyncDataBatch,
    SyncDataBucket, MAX_OP_ID,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use tokio::sync::watch;

/// Prefix of the tombstone buckets that removed buckets are renamed to.
const TOMBSTONE_PREFIX: &str = "$delete_";

/// A bucket's download cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    /// Bucket name.
    pub bucket: String,
    /// Highest op id received for the bucket.
    pub op_id: OpId,
}

/// Download counters of one bucket, used to report progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketOperationProgress {
    /// Op count declared by the last fully applied checkpoint.
    pub at_last: u64,
    /// Entries received since then.
    pub since_last: u64,
}

/// Outcome of [`LocalStore::sync_local_database`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncLocalResult {
    /// Every declared bucket checksum matched.
    pub checkpoint_valid: bool,
    /// The checkpoint was applied to the materialized rows.
    pub ready: bool,
    /// Buckets whose checksum did not match, in checkpoint order.
    pub failures: Vec<String>,
}

impl SyncLocalResult {
    fn applied() -> Self {
        Self {
            checkpoint_valid: true,
            ready: true,
            failures: Vec::new(),
        }
    }

    fn pending() -> Self {
        Self {
            checkpoint_valid: true,
            ready: false,
            failures: Vec::new(),
        }
    }

    fn invalid(failures: Vec<String>) -> Self {
        Self {
            checkpoint_valid: false,
            ready: false,
            failures,
        }
    }
}

/// The storage operations the sync engine depends on.
///
/// [`LocalStore`] is the implementation; the trait is the seam the engine
/// is written against, so tests can wrap or replace the store.
pub trait BucketStorageAdapter: Send + Sync {
    /// Resets per-session state at the start of a connection.
    fn start_session(&self);

    /// Download cursors for every active bucket, ordered by name.
    fn bucket_states(&self) -> Vec<BucketState>;

    /// Durably appends downloaded entries.
    fn save_sync_data(&self, batch: &SyncDataBatch) -> StoreResult<()>;

    /// Logically deletes buckets, turning them into tombstones.
    fn remove_buckets(&self, names: &[String]) -> StoreResult<()>;

    /// True once any bucket has had data applied.
    fn has_completed_sync(&self) -> bool;

    /// Records the checkpoint the engine is converging towards.
    fn set_target_checkpoint(&self, checkpoint: &Checkpoint);

    /// Download counters for every active bucket.
    fn bucket_operation_progress(&self) -> BTreeMap<String, BucketOperationProgress>;

    /// Returns the buckets whose local checksum disagrees with `checkpoint`.
    fn validate_checksums(&self, checkpoint: &Checkpoint) -> Vec<String>;

    /// Validates and, when possible, applies a checkpoint, or only its
    /// buckets up to `priority`.
    fn sync_local_database(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<u8>,
    ) -> StoreResult<SyncLocalResult>;

    /// Runs whatever compaction is due.
    fn auto_compact(&self) -> StoreResult<()>;

    /// Runs every compaction step and rewrites the journal.
    fn force_compact(&self) -> StoreResult<()>;

    /// True if local writes are queued.
    fn has_crud(&self) -> bool;

    /// Head of the CRUD queue.
    fn next_crud_item(&self) -> Option<CrudEntry>;

    /// Up to `limit` entries from the head of the queue.
    fn crud_batch(&self, limit: usize) -> Option<CrudBatch>;

    /// The local transaction at the head of the queue.
    fn next_crud_transaction(&self) -> Option<CrudTransaction>;

    /// Captures the CRUD sequence for a write checkpoint request.
    fn local_target_fence(&self) -> Option<u64>;

    /// Moves the `$local` target if the fence still holds.
    fn update_local_target(&self, fence: u64, op_id: OpId) -> StoreResult<bool>;

    /// Persistent client id.
    fn client_id(&self) -> StoreResult<String>;

    /// The op id used as an unreachable target.
    fn max_op_id(&self) -> OpId {
        MAX_OP_ID
    }

    /// CRUD queue size.
    fn upload_queue_stats(&self, include_size: bool) -> StoreResult<UploadQueueStats>;

    /// Subscribes to CRUD sequence changes.
    fn subscribe_crud(&self) -> watch::Receiver<u64>;

    /// Deletes all synced and local data, keeping the client id.
    fn clear_all(&self) -> StoreResult<()>;
}

impl LocalStore {
    /// Resets per-session caches.
    pub fn start_session(&self) {
        self.set_target(None);
        self.compaction().pending_deletes = true;
    }

    /// Returns download cursors for every active bucket, ordered by name.
    ///
    /// Tombstones and `$local` are excluded.
    #[must_use]
    pub fn bucket_states(&self) -> Vec<BucketState> {
        self.read(|t| {
            t.buckets()
                .filter(|(name, record)| *name != LOCAL_BUCKET && !record.pending_delete)
                .map(|(name, record)| BucketState {
                    bucket: name.to_string(),
                    op_id: record.last_op,
                })
                .collect()
        })
    }

    /// Saves downloaded entries in one write transaction.
    ///
    /// Materialized rows are not touched until the next applied checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRowData`] for a `PUT` or `REMOVE` without
    /// an object, or a storage error. Nothing is saved on error.
    pub fn save_sync_data(&self, batch: &SyncDataBatch) -> StoreResult<()> {
        self.transact(|txn| {
            for bucket in &batch.buckets {
                save_bucket(txn, bucket)?;
            }
            Ok(())
        })?;

        let count = batch.entry_count() as u64;
        self.compaction().counter += count;
        tracing::debug!(buckets = batch.buckets.len(), entries = count, "sync data saved");
        Ok(())
    }

    /// Logically deletes buckets.
    ///
    /// Each bucket's live `PUT`s become `REMOVE`s and its entries move to a
    /// uniquely named tombstone bucket. The tombstone is merged like any
    /// other bucket and deleted by compaction once it has been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change.
    pub fn remove_buckets(&self, names: &[String]) -> StoreResult<()> {
        let removed = self.transact(|txn| {
            let mut removed = 0usize;
            for name in names {
                if tombstone_bucket(txn, name) {
                    removed += 1;
                }
            }
            Ok(removed)
        })?;
        if removed > 0 {
            self.compaction().pending_deletes = true;
        }
        Ok(())
    }

    /// True once any bucket has had data applied. Stays true.
    #[must_use]
    pub fn has_completed_sync(&self) -> bool {
        let flag = self.completed_sync_flag();
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        let completed = self.read(|t| {
            t.buckets()
                .any(|(_, record)| record.last_applied_op > OpId::ZERO)
        });
        if completed {
            flag.store(true, Ordering::SeqCst);
        }
        completed
    }

    /// Records the checkpoint the engine is converging towards.
    pub fn set_target_checkpoint(&self, checkpoint: &Checkpoint) {
        self.set_target(Some(checkpoint.clone()));
    }

    /// Download counters for every active bucket.
    #[must_use]
    pub fn bucket_operation_progress(&self) -> BTreeMap<String, BucketOperationProgress> {
        self.read(|t| {
            t.buckets()
                .filter(|(name, record)| *name != LOCAL_BUCKET && !record.pending_delete)
                .map(|(name, record)| {
                    let progress = BucketOperationProgress {
                        at_last: record.count_at_last,
                        since_last: record.count_since_last,
                    };
                    (name.to_string(), progress)
                })
                .collect()
        })
    }

    /// Returns the buckets whose local checksum disagrees with the declared
    /// one, in checkpoint order. A missing bucket has checksum zero.
    #[must_use]
    pub fn validate_checksums(&self, checkpoint: &Checkpoint) -> Vec<String> {
        self.validate_at(checkpoint, None)
    }

    fn validate_at(&self, checkpoint: &Checkpoint, priority: Option<u8>) -> Vec<String> {
        self.read(|t| {
            checkpoint
                .buckets_at(priority)
                .filter(|declared| t.bucket_checksum(&declared.bucket) != declared.checksum)
                .map(|declared| declared.bucket.clone())
                .collect()
        })
    }

    /// Validates a checkpoint and applies it if nothing blocks it.
    ///
    /// Mismatching buckets are removed and reported. A valid checkpoint is
    /// still not applied while a bucket has not reached its target or local
    /// writes wait for upload; bucket progress is recorded either way.
    ///
    /// With `Some(priority)` only buckets at that priority or lower are
    /// validated and applied, the write checkpoint is ignored and rows with
    /// pending local changes are left alone. Priority 0 is applied even
    /// while local writes wait for upload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRowData`] if a winning payload is not a
    /// JSON object, or a storage error. The rows are left untouched on error.
    pub fn sync_local_database(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<u8>,
    ) -> StoreResult<SyncLocalResult> {
        let failures = self.validate_at(checkpoint, priority);
        if !failures.is_empty() {
            tracing::warn!(?failures, ?priority, "checksum validation failed");
            self.remove_buckets(&failures)?;
            return Ok(SyncLocalResult::invalid(failures));
        }

        let involved: BTreeSet<String> = checkpoint
            .buckets_at(priority)
            .map(|b| b.bucket.clone())
            .collect();
        let merged = self.transact(|txn| {
            for name in &involved {
                txn.update_bucket(name, |record| record.last_op = checkpoint.last_op_id);
            }
            match priority {
                None => {
                    if let Some(write_checkpoint) = checkpoint.write_checkpoint {
                        txn.update_bucket(LOCAL_BUCKET, |record| {
                            record.last_op = write_checkpoint;
                        });
                    }
                    if !can_merge(txn.tables()) {
                        return Ok(None);
                    }
                    let rows = merge(txn)?;
                    for declared in &checkpoint.buckets {
                        txn.update_bucket(&declared.bucket, |record| {
                            record.count_at_last = declared.count.unwrap_or(0);
                            record.count_since_last = 0;
                        });
                    }
                    Ok(Some(rows))
                }
                Some(priority) => {
                    if !can_merge_partial(txn.tables(), &involved, priority) {
                        return Ok(None);
                    }
                    merge_partial(txn, &involved).map(Some)
                }
            }
        })?;

        let Some(rows) = merged else {
            tracing::debug!(
                last_op_id = %checkpoint.last_op_id,
                ?priority,
                "checkpoint valid but not ready"
            );
            return Ok(SyncLocalResult::pending());
        };

        if let Some(priority) = priority {
            tracing::info!(last_op_id = %checkpoint.last_op_id, priority, rows, "partial checkpoint applied");
            return Ok(SyncLocalResult::applied());
        }
        tracing::info!(last_op_id = %checkpoint.last_op_id, rows, "checkpoint applied");

        self.has_completed_sync();
        {
            let mut state = self.compaction();
            state.counter = self.config().compact_interval;
            state.pending_deletes = true;
        }
        self.auto_compact()?;
        Ok(SyncLocalResult::applied())
    }

    /// Deletes tombstones that are fully applied and, once enough entries
    /// have been saved, superseded and applied `REMOVE` entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change.
    pub fn auto_compact(&self) -> StoreResult<()> {
        let mut state = self.compaction();
        if state.pending_deletes {
            let deleted = self.transact(delete_pending_buckets)?;
            if deleted > 0 {
                tracing::debug!(deleted, "tombstone buckets deleted");
            }
            state.pending_deletes = false;
        }
        if state.counter >= self.config().compact_interval {
            let cleared = self.transact(clear_remove_ops)?;
            if cleared > 0 {
                tracing::debug!(cleared, "superseded entries compacted");
            }
            state.counter = 0;
        }
        Ok(())
    }

    /// Runs every compaction step now and rewrites the journal as a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change or write the
    /// snapshot.
    pub fn force_compact(&self) -> StoreResult<()> {
        {
            let mut state = self.compaction();
            state.counter = self.config().compact_interval;
            state.pending_deletes = true;
        }
        self.auto_compact()?;
        self.snapshot()
    }

    /// Deletes all buckets, entries, rows and queued writes.
    ///
    /// The client id survives.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change.
    pub fn clear_all(&self) -> StoreResult<()> {
        self.transact(|txn| {
            let tables = txn.tables();
            let buckets: Vec<String> = tables.buckets().map(|(name, _)| name.to_string()).collect();
            let ops: Vec<(String, OpId)> = buckets
                .iter()
                .flat_map(|name| tables.ops(name).map(move |(op_id, _)| (name.clone(), op_id)))
                .collect();
            let rows: Vec<RowKey> = tables
                .table_names()
                .flat_map(|table| tables.rows(table).map(move |(id, _)| RowKey::new(table, id)))
                .collect();
            let crud: Vec<u64> = tables.crud().map(|entry| entry.client_id).collect();
            let updated: Vec<RowKey> = tables.updated_rows().iter().cloned().collect();

            for (bucket, op_id) in ops {
                txn.set_op(&bucket, op_id, None);
            }
            for name in buckets {
                txn.set_bucket(&name, None);
            }
            for key in rows {
                txn.set_row(&key.table, &key.id, None);
            }
            for id in crud {
                txn.set_crud(id, None);
            }
            for key in updated {
                txn.unmark_updated(key);
            }
            Ok(())
        })?;

        self.set_target(None);
        self.completed_sync_flag().store(false, Ordering::SeqCst);
        {
            let mut state = self.compaction();
            state.counter = 0;
            state.pending_deletes = false;
        }
        tracing::info!("local data cleared");
        self.snapshot()
    }
}

fn save_bucket(txn: &mut WriteTxn<'_>, data: &SyncDataBucket) -> StoreResult<()> {
    let name = data.bucket.as_str();
    let mut record = txn.tables().bucket(name).cloned().unwrap_or_default();
    record.count_since_last += data.data.len() as u64;

    for entry in &data.data {
        record.last_op = record.last_op.max(entry.op_id);
        match entry.op {
            OpType::Move => {
                record.add_checksum += entry.checksum;
                if let Some(target) = move_target(entry) {
                    record.target_op = record.target_op.max(target);
                }
            }
            OpType::Clear => {
                let stored: Vec<(OpId, RowKey)> = txn
                    .tables()
                    .ops(name)
                    .map(|(op_id, op)| (op_id, op.row_key()))
                    .collect();
                for (op_id, key) in stored {
                    txn.set_op(name, op_id, None);
                    txn.mark_updated(key);
                }
                record.add_checksum = entry.checksum;
                record.last_applied_op = OpId::ZERO;
            }
            OpType::Put | OpType::Remove => save_op(txn, name, entry)?,
        }
    }

    txn.set_bucket(name, Some(record));
    Ok(())
}

fn save_op(txn: &mut WriteTxn<'_>, bucket: &str, entry: &OplogEntry) -> StoreResult<()> {
    let key = entry.row_key().ok_or_else(|| StoreError::InvalidRowData {
        object_type: entry.object_type.clone().unwrap_or_default(),
        object_id: entry.object_id.clone().unwrap_or_default(),
    })?;
    let op_id = entry.op_id;

    // Re-saving the same entry replaces it.
    if txn.tables().op(bucket, op_id).is_some() {
        txn.set_op(bucket, op_id, None);
    }

    let mut superseded = false;
    if let Some(live) = txn.tables().live_op(&key, bucket, entry.subkey.as_deref()) {
        if live < op_id {
            if let Some(mut previous) = txn.tables().op(bucket, live).cloned() {
                previous.superseded = true;
                txn.set_op(bucket, live, Some(previous));
            }
        } else {
            superseded = true;
        }
    }

    let data = match entry.op {
        OpType::Put => entry.data.clone(),
        _ => None,
    };
    txn.set_op(
        bucket,
        op_id,
        Some(StoredOp {
            op: entry.op,
            object_type: key.table,
            object_id: key.id,
            subkey: entry.subkey.clone(),
            checksum: entry.checksum,
            data,
            superseded,
        }),
    );
    Ok(())
}

/// Reads the op id a `MOVE` asks the bucket to reach, if any.
fn move_target(entry: &OplogEntry) -> Option<OpId> {
    let data: Value = serde_json::from_str(entry.data.as_deref()?).ok()?;
    serde_json::from_value(data.get("target")?.clone()).ok()
}

fn tombstone_bucket(txn: &mut WriteTxn<'_>, name: &str) -> bool {
    if txn.tables().bucket(name).is_none() {
        return false;
    }
    let tombstone = format!("{TOMBSTONE_PREFIX}{name}_{}", uuid::Uuid::new_v4());
    let ops: Vec<(OpId, StoredOp)> = txn
        .tables()
        .ops(name)
        .map(|(op_id, op)| (op_id, op.clone()))
        .collect();
    let last_op = ops.last().map_or(OpId::ZERO, |(op_id, _)| *op_id);

    for (op_id, mut op) in ops {
        txn.set_op(name, op_id, None);
        if op.op == OpType::Put && !op.superseded {
            op.op = OpType::Remove;
            op.data = None;
        }
        txn.set_op(&tombstone, op_id, Some(op));
    }
    txn.set_bucket(
        &tombstone,
        Some(BucketRecord {
            last_op,
            pending_delete: true,
            ..BucketRecord::default()
        }),
    );
    txn.set_bucket(name, None);

    tracing::debug!(bucket = %name, tombstone = %tombstone, "bucket removed");
    true
}

/// A checkpoint can be applied once every bucket has reached its target and
/// no local write waits for upload.
fn can_merge(tables: &Tables) -> bool {
    let blocked = tables.buckets().any(|(name, record)| {
        (name == LOCAL_BUCKET || !record.pending_delete) && record.target_op > record.last_op
    });
    !blocked && tables.crud_len() == 0
}

/// Priority 0 may be published while local writes wait for upload.
fn may_publish_with_outstanding_uploads(priority: u8) -> bool {
    priority == 0
}

/// A partial checkpoint can be applied once its buckets have reached their
/// targets. Unless the priority allows it, local writes block it too.
fn can_merge_partial(tables: &Tables, involved: &BTreeSet<String>, priority: u8) -> bool {
    let blocked = involved.iter().any(|name| {
        tables
            .bucket(name)
            .is_some_and(|record| record.target_op > record.last_op)
    });
    if blocked {
        return false;
    }
    if may_publish_with_outstanding_uploads(priority) {
        return true;
    }
    let local_blocked = tables
        .bucket(LOCAL_BUCKET)
        .is_some_and(|record| record.target_op > record.last_op);
    !local_blocked && tables.crud_len() == 0
}

/// Re-merges the rows touched by `involved` buckets and marks those buckets
/// applied.
///
/// Other buckets only contribute entries they have already applied. Rows
/// with pending local changes keep their local value.
fn merge_partial(txn: &mut WriteTxn<'_>, involved: &BTreeSet<String>) -> StoreResult<usize> {
    let tables = txn.tables();
    let mut touched = BTreeSet::new();
    for name in involved {
        let Some(record) = tables.bucket(name) else {
            continue;
        };
        touched.extend(
            tables
                .ops_after(name, record.last_applied_op)
                .map(|(_, op)| op.row_key())
                .filter(|key| !tables.updated_rows().contains(key)),
        );
    }

    let visible = |bucket: &str, op_id: OpId| {
        involved.contains(bucket)
            || tables
                .bucket(bucket)
                .is_some_and(|record| op_id <= record.last_applied_op)
    };
    let mut merged = Vec::with_capacity(touched.len());
    for key in touched {
        let row = tables.merged_row_where(&key, visible)?;
        merged.push((key, row));
    }
    let applied: Vec<String> = involved
        .iter()
        .filter(|name| {
            tables
                .bucket(name)
                .is_some_and(|record| record.last_applied_op != record.last_op)
        })
        .cloned()
        .collect();

    let count = merged.len();
    for (key, row) in merged {
        txn.set_row(&key.table, &key.id, row);
    }
    for name in applied {
        txn.update_bucket(&name, |record| record.last_applied_op = record.last_op);
    }
    Ok(count)
}

/// Re-merges every touched row and marks all buckets applied.
///
/// Returns the number of rows re-merged.
fn merge(txn: &mut WriteTxn<'_>) -> StoreResult<usize> {
    let tables = txn.tables();
    let mut touched: BTreeSet<RowKey> = tables.updated_rows().clone();
    for (name, record) in tables.buckets() {
        touched.extend(
            tables
                .ops_after(name, record.last_applied_op)
                .map(|(_, op)| op.row_key()),
        );
    }

    let mut merged = Vec::with_capacity(touched.len());
    for key in touched {
        let row = tables.merged_row(&key)?;
        merged.push((key, row));
    }
    let applied: Vec<String> = tables
        .buckets()
        .filter(|(_, record)| record.last_applied_op != record.last_op)
        .map(|(name, _)| name.to_string())
        .collect();
    let updated: Vec<RowKey> = tables.updated_rows().iter().cloned().collect();

    let count = merged.len();
    for (key, row) in merged {
        txn.set_row(&key.table, &key.id, row);
    }
    for name in applied {
        txn.update_bucket(&name, |record| record.last_applied_op = record.last_op);
    }
    for key in updated {
        txn.unmark_updated(key);
    }
    Ok(count)
}

fn delete_pending_buckets(txn: &mut WriteTxn<'_>) -> StoreResult<usize> {
    let tables = txn.tables();
    let ready: Vec<String> = tables
        .buckets()
        .filter(|(_, record)| {
            record.pending_delete
                && record.last_applied_op == record.last_op
                && record.last_op >= record.target_op
        })
        .map(|(name, _)| name.to_string())
        .collect();
    let ops: Vec<(String, OpId)> = ready
        .iter()
        .flat_map(|name| tables.ops(name).map(move |(op_id, _)| (name.clone(), op_id)))
        .collect();

    for (bucket, op_id) in ops {
        txn.set_op(&bucket, op_id, None);
    }
    for name in &ready {
        txn.set_bucket(name, None);
    }
    Ok(ready.len())
}

/// Deletes superseded entries and applied `REMOVE`s, folding their checksums
/// into the bucket so the bucket checksum is unchanged.
fn clear_remove_ops(txn: &mut WriteTxn<'_>) -> StoreResult<usize> {
    let tables = txn.tables();
    let mut plan: Vec<(String, Checksum, Vec<OpId>)> = Vec::new();
    for (name, record) in tables.buckets() {
        let mut folded = Checksum::ZERO;
        let mut ids = Vec::new();
        for (op_id, op) in tables.ops(name) {
            if op.superseded || (op.op == OpType::Remove && op_id <= record.last_applied_op) {
                folded += op.checksum;
                ids.push(op_id);
            }
        }
        if !ids.is_empty() {
            plan.push((name.to_string(), folded, ids));
        }
    }

    let mut cleared = 0;
    for (name, folded, ids) in plan {
        cleared += ids.len();
        for op_id in ids {
            txn.set_op(&name, op_id, None);
        }
        txn.update_bucket(&name, |record| record.add_checksum += folded);
    }
    Ok(cleared)
}

impl BucketStorageAdapter for LocalStore {
    fn start_session(&self) {
        LocalStore::start_session(self);
    }

    fn bucket_states(&self) -> Vec<BucketState> {
        LocalStore::bucket_states(self)
    }

    fn save_sync_data(&self, batch: &SyncDataBatch) -> StoreResult<()> {
        LocalStore::save_sync_data(self, batch)
    }

    fn remove_buckets(&self, names: &[String]) -> StoreResult<()> {
        LocalStore::remove_buckets(self, names)
    }

    fn has_completed_sync(&self) -> bool {
        LocalStore::has_completed_sync(self)
    }

    fn set_target_checkpoint(&self, checkpoint: &Checkpoint) {
        LocalStore::set_target_checkpoint(self, checkpoint);
    }

    fn bucket_operation_progress(&self) -> BTreeMap<String, BucketOperationProgress> {
        LocalStore::bucket_operation_progress(self)
    }

    fn validate_checksums(&self, checkpoint: &Checkpoint) -> Vec<String> {
        LocalStore::validate_checksums(self, checkpoint)
    }

    fn sync_local_database(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<u8>,
    ) -> StoreResult<SyncLocalResult> {
        LocalStore::sync_local_database(self, checkpoint, priority)
    }

    fn auto_compact(&self) -> StoreResult<()> {
        LocalStore::auto_compact(self)
    }

    fn force_compact(&self) -> StoreResult<()> {
        LocalStore::force_compact(self)
    }

    fn has_crud(&self) -> bool {
        LocalStore::has_crud(self)
    }

    fn next_crud_item(&self) -> Option<CrudEntry> {
        LocalStore::next_crud_item(self)
    }

    fn crud_batch(&self, limit: usize) -> Option<CrudBatch> {
        LocalStore::crud_batch(self, limit)
    }

    fn next_crud_transaction(&self) -> Option<CrudTransaction> {
        LocalStore::next_crud_transaction(self)
    }

    fn local_target_fence(&self) -> Option<u64> {
        LocalStore::local_target_fence(self)
    }

    fn update_local_target(&self, fence: u64, op_id: OpId) -> StoreResult<bool> {
        LocalStore::update_local_target(self, fence, op_id)
    }

    fn client_id(&self) -> StoreResult<String> {
        LocalStore::client_id(self)
    }

    fn upload_queue_stats(&self, include_size: bool) -> StoreResult<UploadQueueStats> {
        LocalStore::upload_queue_stats(self, include_size)
    }

    fn subscribe_crud(&self) -> watch::Receiver<u64> {
        LocalStore::subscribe_crud(self)
    }

    fn clear_all(&self) -> StoreResult<()> {
        LocalStore::clear_all(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_protocol::BucketChecksum;

    fn batch(bucket: &str, data: Vec<OplogEntry>) -> SyncDataBatch {
        SyncDataBatch::from(SyncDataBucket::new(bucket, data))
    }

    #[test]
    fn resaving_an_entry_is_idempotent() {
        let store = LocalStore::open_in_memory().unwrap();
        let data = batch("b", vec![OplogEntry::put(1, "assets", "O1", "{}", 1)]);
        store.save_sync_data(&data).unwrap();
        store.save_sync_data(&data).unwrap();

        assert_eq!(store.read(Tables::op_count), 1);
        assert_eq!(store.read(|t| t.bucket_checksum("b")), Checksum::new(1));
    }

    #[test]
    fn older_entry_arrives_superseded() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .save_sync_data(&batch("b", vec![OplogEntry::put(5, "assets", "O1", "{}", 5)]))
            .unwrap();
        store
            .save_sync_data(&batch("b", vec![OplogEntry::put(2, "assets", "O1", "{}", 2)]))
            .unwrap();

        let key = RowKey::new("assets", "O1");
        assert_eq!(store.read(|t| t.live_op(&key, "b", None)), Some(OpId::new(5)));
        assert!(store.read(|t| t.op("b", OpId::new(2)).unwrap().superseded));
    }

    #[test]
    fn data_entry_without_object_is_rejected() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut entry = OplogEntry::put(1, "assets", "O1", "{}", 1);
        entry.object_id = None;
        let result = store.save_sync_data(&batch("b", vec![entry]));
        assert!(matches!(result, Err(StoreError::InvalidRowData { .. })));
        assert!(store.bucket_states().is_empty());
    }

    #[test]
    fn empty_data_creates_bucket() {
        let store = LocalStore::open_in_memory().unwrap();
        store.save_sync_data(&batch("b", Vec::new())).unwrap();
        assert_eq!(
            store.bucket_states(),
            vec![BucketState {
                bucket: "b".into(),
                op_id: OpId::ZERO
            }]
        );
    }

    #[test]
    fn tombstone_rewrites_live_puts() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .save_sync_data(&batch(
                "b",
                vec![
                    OplogEntry::put(1, "assets", "O1", "{}", 1),
                    OplogEntry::put(2, "assets", "O1", "{}", 2),
                ],
            ))
            .unwrap();
        store.remove_buckets(&["b".to_string(), "missing".to_string()]).unwrap();

        assert!(store.bucket_states().is_empty());
        let (name, record) = store
            .read(|t| t.buckets().map(|(n, r)| (n.to_string(), r.clone())).next())
            .unwrap();
        assert!(name.starts_with("$delete_b_"));
        assert!(record.pending_delete);
        assert_eq!(record.last_op, OpId::new(2));

        let ops: Vec<(OpType, bool)> =
            store.read(|t| t.ops(&name).map(|(_, op)| (op.op, op.superseded)).collect());
        assert_eq!(ops, vec![(OpType::Put, true), (OpType::Remove, false)]);
    }

    #[test]
    fn missing_bucket_fails_nonzero_checksum_only() {
        let store = LocalStore::open_in_memory().unwrap();
        let checkpoint = Checkpoint::new(
            1,
            vec![BucketChecksum::new("a", 0), BucketChecksum::new("b", 1)],
        );
        assert_eq!(store.validate_checksums(&checkpoint), vec!["b".to_string()]);
    }

    #[test]
    fn start_session_drops_target() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_target_checkpoint(&Checkpoint::new(3, Vec::new()));
        assert!(store.target_checkpoint().is_some());
        store.start_session();
        assert!(store.target_checkpoint().is_none());
    }

    #[test]
    fn auto_compact_waits_for_interval() {
        let config = crate::StoreConfig::new().with_compact_interval(10);
        let store = LocalStore::open_in_memory_with_config(config).unwrap();
        // The first call runs at startup and resets the counter.
        store.auto_compact().unwrap();

        store
            .save_sync_data(&batch(
                "b",
                vec![
                    OplogEntry::put(1, "assets", "O1", "{}", 1),
                    OplogEntry::put(2, "assets", "O1", "{}", 2),
                ],
            ))
            .unwrap();
        store.auto_compact().unwrap();
        assert_eq!(store.read(Tables::op_count), 2);

        store.force_compact().unwrap();
        assert_eq!(store.read(Tables::op_count), 1);
        assert_eq!(store.read(|t| t.bucket_checksum("b")), Checksum::new(3));
    }

    #[test]
    fn clear_all_keeps_client_id() {
        let store = LocalStore::open_in_memory().unwrap();
        let client_id = store.client_id().unwrap();
        store
            .save_sync_data(&batch("b", vec![OplogEntry::put(1, "assets", "O1", "{}", 1)]))
            .unwrap();
        store
            .sync_local_database(&Checkpoint::new(1, vec![BucketChecksum::new("b", 1)]), None)
            .unwrap();
        store
            .write_transaction(|tx| tx.put("notes", "n1", crate::Row::new()))
            .unwrap();
        assert!(store.has_completed_sync());

        store.clear_all().unwrap();
        assert!(!store.has_completed_sync());
        assert!(!store.has_crud());
        assert_eq!(store.read(|t| (t.row_count(), t.op_count(), t.buckets().count())), (0, 0, 0));
        assert_eq!(store.client_id().unwrap(), client_id);
    }
}
