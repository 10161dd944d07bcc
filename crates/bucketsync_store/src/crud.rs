//! The CRUD upload queue.
//!
//! Local writes queue up as [`CrudEntry`] rows ordered by client id. An
//! uploader reads a [`CrudBatch`] or a [`CrudTransaction`], forwards it
//! upstream and then calls `complete`, which is the only step that removes
//! entries from the queue.

use crate::error::StoreResult;
use crate::store::{LocalStore, LOCAL_BUCKET};
use bucketsync_protocol::{CrudEntry, OpId, MAX_OP_ID};
use std::fmt;

/// Fixed per-entry overhead added to the serialized size estimate.
const ENTRY_SIZE_OVERHEAD: u64 = 20;

/// A run of queued entries, in upload order.
#[derive(Debug)]
pub struct CrudBatch {
    /// The entries, ordered by client id.
    pub crud: Vec<CrudEntry>,
    /// More entries remain after this batch.
    pub have_more: bool,
    store: LocalStore,
}

impl CrudBatch {
    /// Acknowledges the batch: deletes its entries and advances the local
    /// target.
    ///
    /// Call this only after the server has durably accepted the entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change.
    pub fn complete(self, write_checkpoint: Option<OpId>) -> StoreResult<()> {
        complete_entries(&self.store, &self.crud, write_checkpoint)
    }
}

/// All queued entries of one local transaction.
#[derive(Debug)]
pub struct CrudTransaction {
    /// The local transaction id, or `None` for a standalone entry.
    pub transaction_id: Option<u64>,
    /// The entries, ordered by client id.
    pub crud: Vec<CrudEntry>,
    store: LocalStore,
}

impl CrudTransaction {
    /// Acknowledges the transaction. See [`CrudBatch::complete`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change.
    pub fn complete(self, write_checkpoint: Option<OpId>) -> StoreResult<()> {
        complete_entries(&self.store, &self.crud, write_checkpoint)
    }
}

fn complete_entries(
    store: &LocalStore,
    crud: &[CrudEntry],
    write_checkpoint: Option<OpId>,
) -> StoreResult<()> {
    match crud.last() {
        Some(last) => store.complete_crud(last.client_id, write_checkpoint),
        None => Ok(()),
    }
}

/// Size of the upload queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadQueueStats {
    /// Number of queued entries.
    pub count: usize,
    /// Approximate serialized size in bytes, when requested.
    pub size: Option<u64>,
}

impl fmt::Display for UploadQueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            Some(size) => write!(f, "{} entries ({size} bytes)", self.count),
            None => write!(f, "{} entries", self.count),
        }
    }
}

impl LocalStore {
    /// Returns true if local writes are waiting for upload.
    #[must_use]
    pub fn has_crud(&self) -> bool {
        self.read(|t| t.crud_len() > 0)
    }

    /// Returns the head of the queue.
    #[must_use]
    pub fn next_crud_item(&self) -> Option<CrudEntry> {
        self.read(|t| t.crud().next().cloned())
    }

    /// Returns up to `limit` entries from the head of the queue, or `None`
    /// if it is empty. A `limit` of zero is treated as one.
    #[must_use]
    pub fn crud_batch(&self, limit: usize) -> Option<CrudBatch> {
        let limit = limit.max(1);
        let (crud, total) = self.read(|t| {
            let crud: Vec<CrudEntry> = t.crud().take(limit).cloned().collect();
            (crud, t.crud_len())
        });
        if crud.is_empty() {
            return None;
        }
        Some(CrudBatch {
            have_more: total > crud.len(),
            crud,
            store: self.clone(),
        })
    }

    /// Returns the transaction at the head of the queue.
    ///
    /// An entry without a transaction id stands alone.
    #[must_use]
    pub fn next_crud_transaction(&self) -> Option<CrudTransaction> {
        let crud = self.read(|t| {
            let mut entries = t.crud();
            let head = entries.next()?.clone();
            let mut crud = vec![head.clone()];
            if head.transaction_id.is_some() {
                crud.extend(
                    entries
                        .filter(|e| e.transaction_id == head.transaction_id)
                        .cloned(),
                );
            }
            Some(crud)
        })?;
        Some(CrudTransaction {
            transaction_id: crud[0].transaction_id,
            crud,
            store: self.clone(),
        })
    }

    /// Deletes every entry up to and including `last_client_id` and moves the
    /// `$local` target.
    ///
    /// With a write checkpoint the target moves to it, but only once the
    /// queue is empty. Without one the target is pinned at [`MAX_OP_ID`]
    /// until [`LocalStore::update_local_target`] succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change.
    pub fn complete_crud(
        &self,
        last_client_id: u64,
        write_checkpoint: Option<OpId>,
    ) -> StoreResult<()> {
        self.transact(|txn| {
            let done: Vec<u64> = txn
                .tables()
                .crud()
                .map(|e| e.client_id)
                .take_while(|id| *id <= last_client_id)
                .collect();
            for id in done {
                txn.set_crud(id, None);
            }

            let target = match write_checkpoint {
                Some(op_id) if txn.tables().crud_len() == 0 => Some(op_id),
                Some(_) => None,
                None => Some(MAX_OP_ID),
            };
            if let Some(target) = target {
                txn.update_bucket(LOCAL_BUCKET, |local| local.target_op = target);
            }
            Ok(())
        })?;
        tracing::debug!(last_client_id, ?write_checkpoint, "crud completed");
        Ok(())
    }

    /// Captures the CRUD sequence while `$local` still waits for a write
    /// checkpoint.
    ///
    /// Pass the result to [`LocalStore::update_local_target`] after fetching
    /// a write checkpoint; a local write in between invalidates it.
    #[must_use]
    pub fn local_target_fence(&self) -> Option<u64> {
        self.read(|t| {
            let waiting = t
                .bucket(LOCAL_BUCKET)
                .is_some_and(|local| local.target_op == MAX_OP_ID);
            let seq = t.meta().crud_seq;
            (waiting && seq > 0).then_some(seq)
        })
    }

    /// Sets the `$local` target to `op_id` if no local write happened since
    /// `fence` was taken.
    ///
    /// Returns whether the target moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot commit the change.
    pub fn update_local_target(&self, fence: u64, op_id: OpId) -> StoreResult<bool> {
        let updated = self.transact(|txn| {
            let tables = txn.tables();
            if tables.crud_len() > 0 || tables.meta().crud_seq != fence {
                return Ok(false);
            }
            txn.update_bucket(LOCAL_BUCKET, |local| local.target_op = op_id);
            Ok(true)
        })?;
        if updated {
            tracing::debug!(op_id = %op_id, "local target updated");
        } else {
            tracing::debug!(fence, "local writes raced the write checkpoint");
        }
        Ok(updated)
    }

    /// Returns the queue size, optionally with an approximate byte size.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be serialized.
    pub fn upload_queue_stats(&self, include_size: bool) -> StoreResult<UploadQueueStats> {
        self.read(|t| {
            let size = if include_size {
                let mut total = 0u64;
                for entry in t.crud() {
                    let json = serde_json::to_vec(&entry.to_output())
                        .map_err(crate::error::StoreError::codec)?;
                    total += json.len() as u64 + ENTRY_SIZE_OVERHEAD;
                }
                Some(total)
            } else {
                None
            };
            Ok(UploadQueueStats {
                count: t.crud_len(),
                size,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::Row;

    fn insert(store: &LocalStore, ids: &[&str]) {
        store
            .write_transaction(|tx| {
                for id in ids {
                    tx.put("assets", id, Row::new())?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn local_target(store: &LocalStore) -> OpId {
        store.read(|t| t.bucket(LOCAL_BUCKET).unwrap().target_op)
    }

    #[test]
    fn transactions_come_out_in_order() {
        let store = LocalStore::open_in_memory().unwrap();
        insert(&store, &["a", "b"]);
        insert(&store, &["c"]);

        let first = store.next_crud_transaction().unwrap();
        assert_eq!(first.transaction_id, Some(1));
        let ids: Vec<u64> = first.crud.iter().map(|e| e.client_id).collect();
        assert_eq!(ids, vec![1, 2]);

        // Reading does not consume.
        assert_eq!(store.next_crud_transaction().unwrap().crud.len(), 2);
        first.complete(None).unwrap();

        let second = store.next_crud_transaction().unwrap();
        assert_eq!(second.crud[0].client_id, 3);
        second.complete(None).unwrap();
        assert!(store.next_crud_transaction().is_none());
        assert!(!store.has_crud());
    }

    #[test]
    fn zero_limit_batch_still_returns_head() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.crud_batch(0).is_none());

        insert(&store, &["a", "b"]);
        let batch = store.crud_batch(0).unwrap();
        assert_eq!(batch.crud.len(), 1);
        assert!(batch.have_more);
    }

    #[test]
    fn batch_respects_limit() {
        let store = LocalStore::open_in_memory().unwrap();
        insert(&store, &["a", "b", "c"]);

        let batch = store.crud_batch(2).unwrap();
        assert!(batch.have_more);
        assert_eq!(batch.crud.len(), 2);
        batch.complete(None).unwrap();

        let batch = store.crud_batch(2).unwrap();
        assert!(!batch.have_more);
        assert_eq!(batch.crud[0].id, "c");
        batch.complete(None).unwrap();
        assert!(store.crud_batch(2).is_none());
    }

    #[test]
    fn write_checkpoint_applies_only_to_empty_queue() {
        let store = LocalStore::open_in_memory().unwrap();
        insert(&store, &["a"]);
        insert(&store, &["b"]);

        store.next_crud_transaction().unwrap().complete(Some(OpId::new(7))).unwrap();
        assert_eq!(local_target(&store), MAX_OP_ID);

        store.next_crud_transaction().unwrap().complete(Some(OpId::new(9))).unwrap();
        assert_eq!(local_target(&store), OpId::new(9));
    }

    #[test]
    fn fence_detects_racing_writes() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.local_target_fence(), None);

        insert(&store, &["a"]);
        store.crud_batch(10).unwrap().complete(None).unwrap();
        let fence = store.local_target_fence().unwrap();
        assert_eq!(fence, 1);

        insert(&store, &["b"]);
        assert!(!store.update_local_target(fence, OpId::new(4)).unwrap());
        assert_eq!(local_target(&store), MAX_OP_ID);

        store.crud_batch(10).unwrap().complete(None).unwrap();
        let fence = store.local_target_fence().unwrap();
        assert!(store.update_local_target(fence, OpId::new(5)).unwrap());
        assert_eq!(local_target(&store), OpId::new(5));
        assert_eq!(store.local_target_fence(), None);
    }

    #[test]
    fn stats_count_and_size() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.upload_queue_stats(false).unwrap().to_string(), "0 entries");

        insert(&store, &["a", "b"]);
        let stats = store.upload_queue_stats(true).unwrap();
        assert_eq!(stats.count, 2);
        assert!(stats.size.unwrap() > 2 * ENTRY_SIZE_OVERHEAD);
        assert_eq!(store.upload_queue_stats(false).unwrap().size, None);
    }
}
