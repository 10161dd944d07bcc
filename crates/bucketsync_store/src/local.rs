//! Application-level local writes.
//!
//! Each effective change updates the materialized row, queues one
//! [`CrudEntry`], pins `$local` at [`MAX_OP_ID`] so no checkpoint is applied
//! over it before upload, and marks the row for re-merge.

use crate::error::{StoreError, StoreResult};
use crate::store::{LocalStore, WriteTxn, LOCAL_BUCKET};
use crate::tables::Row;
use bucketsync_protocol::{CrudEntry, RowKey, UpdateType, MAX_OP_ID};
use serde_json::Map;

/// A local write transaction.
///
/// Every write in one transaction shares one CRUD transaction id, so the
/// writes upload together.
pub struct LocalTxn<'t, 'a> {
    txn: &'t mut WriteTxn<'a>,
    tx_id: Option<u64>,
}

impl LocalStore {
    /// Runs `f` as one local write transaction.
    ///
    /// Either every write made by `f` lands, together with its CRUD entries,
    /// or none does.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a storage error.
    pub fn write_transaction<R>(
        &self,
        f: impl FnOnce(&mut LocalTxn<'_, '_>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.transact(|txn| {
            let mut local = LocalTxn { txn, tx_id: None };
            f(&mut local)
        })
    }
}

impl LocalTxn<'_, '_> {
    /// Reads a row, including writes made earlier in this transaction.
    #[must_use]
    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.txn.tables().row(table, id).cloned()
    }

    /// Inserts or replaces a row.
    ///
    /// Any `"id"` in `values` is ignored in favour of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTable`] for an unusable table name.
    pub fn put(&mut self, table: &str, id: &str, mut values: Row) -> StoreResult<()> {
        validate_table(table)?;
        values.remove("id");
        let mut row = values.clone();
        row.insert("id".into(), id.into());

        self.txn.set_row(table, id, Some(row));
        self.record(UpdateType::Put, table, id, Some(values));
        Ok(())
    }

    /// Updates the given columns of an existing row.
    ///
    /// Only columns whose value actually changes are written and queued.
    /// Returns whether the row existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTable`] for an unusable table name.
    pub fn patch(&mut self, table: &str, id: &str, values: Row) -> StoreResult<bool> {
        validate_table(table)?;
        let Some(mut row) = self.get(table, id) else {
            return Ok(false);
        };

        let changed: Map<_, _> = values
            .into_iter()
            .filter(|(column, value)| column != "id" && row.get(column) != Some(value))
            .collect();
        if changed.is_empty() {
            return Ok(true);
        }

        for (column, value) in &changed {
            row.insert(column.clone(), value.clone());
        }
        self.txn.set_row(table, id, Some(row));
        self.record(UpdateType::Patch, table, id, Some(changed));
        Ok(true)
    }

    /// Deletes a row. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTable`] for an unusable table name.
    pub fn delete(&mut self, table: &str, id: &str) -> StoreResult<bool> {
        validate_table(table)?;
        if self.get(table, id).is_none() {
            return Ok(false);
        }
        self.txn.set_row(table, id, None);
        self.record(UpdateType::Delete, table, id, None);
        Ok(true)
    }

    fn record(&mut self, op: UpdateType, table: &str, id: &str, data: Option<Row>) {
        let mut meta = self.txn.tables().meta().clone();
        let tx_id = match self.tx_id {
            Some(tx_id) => tx_id,
            None => {
                let tx_id = meta.next_tx_id.max(1);
                meta.next_tx_id = tx_id + 1;
                self.tx_id = Some(tx_id);
                tx_id
            }
        };
        meta.crud_seq += 1;
        let client_id = meta.crud_seq;
        self.txn.set_meta(meta);

        self.txn.set_crud(
            client_id,
            Some(CrudEntry {
                client_id,
                op,
                table: table.to_string(),
                id: id.to_string(),
                transaction_id: Some(tx_id),
                data,
            }),
        );

        let mut local = self
            .txn
            .tables()
            .bucket(LOCAL_BUCKET)
            .cloned()
            .unwrap_or_default();
        local.pending_delete = true;
        local.target_op = MAX_OP_ID;
        self.txn.set_bucket(LOCAL_BUCKET, Some(local));

        self.txn.mark_updated(RowKey::new(table, id));
    }
}

fn validate_table(table: &str) -> StoreResult<()> {
    if table.is_empty() || table.starts_with('$') {
        return Err(StoreError::invalid_table(table));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_protocol::OpId;
    use serde_json::json;

    fn obj(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn put_queues_all_columns_but_id() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .write_transaction(|tx| tx.put("assets", "O3", obj(json!({"id": "x", "make": "acme"}))))
            .unwrap();

        assert_eq!(
            store.get("assets", "O3").unwrap(),
            obj(json!({"id": "O3", "make": "acme"}))
        );
        let entries: Vec<CrudEntry> = store.read(|t| t.crud().cloned().collect());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].client_id, 1);
        assert_eq!(entries[0].op, UpdateType::Put);
        assert_eq!(entries[0].data, Some(obj(json!({"make": "acme"}))));

        let local = store.read(|t| t.bucket(LOCAL_BUCKET).cloned()).unwrap();
        assert!(local.pending_delete);
        assert_eq!(local.target_op, MAX_OP_ID);
        assert_eq!(local.last_op, OpId::ZERO);
    }

    #[test]
    fn patch_records_only_changed_columns() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .write_transaction(|tx| tx.put("assets", "O1", obj(json!({"a": 1, "b": 2}))))
            .unwrap();
        let existed = store
            .write_transaction(|tx| tx.patch("assets", "O1", obj(json!({"a": 1, "b": 3}))))
            .unwrap();
        assert!(existed);

        let last = store.read(|t| t.crud().last().cloned()).unwrap();
        assert_eq!(last.op, UpdateType::Patch);
        assert_eq!(last.data, Some(obj(json!({"b": 3}))));
        assert_eq!(store.get("assets", "O1").unwrap()["b"], json!(3));
    }

    #[test]
    fn no_op_writes_queue_nothing() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .write_transaction(|tx| tx.put("assets", "O1", obj(json!({"a": 1}))))
            .unwrap();
        let before = store.read(|t| t.crud_len());

        assert!(store
            .write_transaction(|tx| tx.patch("assets", "O1", obj(json!({"a": 1}))))
            .unwrap());
        assert!(!store
            .write_transaction(|tx| tx.patch("assets", "missing", obj(json!({"a": 1}))))
            .unwrap());
        assert!(!store
            .write_transaction(|tx| tx.delete("assets", "missing"))
            .unwrap());
        assert_eq!(store.read(|t| t.crud_len()), before);
    }

    #[test]
    fn one_transaction_shares_one_tx_id() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .write_transaction(|tx| {
                tx.put("assets", "A", Row::new())?;
                tx.put("assets", "B", Row::new())?;
                tx.delete("assets", "A")?;
                Ok(())
            })
            .unwrap();
        store
            .write_transaction(|tx| tx.put("assets", "C", Row::new()))
            .unwrap();

        let tx_ids: Vec<Option<u64>> = store.read(|t| t.crud().map(|e| e.transaction_id).collect());
        assert_eq!(tx_ids, vec![Some(1), Some(1), Some(1), Some(2)]);
        assert!(store.get("assets", "A").is_none());
    }

    #[test]
    fn failed_transaction_rolls_back_rows_and_queue() {
        let store = LocalStore::open_in_memory().unwrap();
        let result = store.write_transaction(|tx| {
            tx.put("assets", "A", Row::new())?;
            tx.put("$bad", "B", Row::new())
        });
        assert!(matches!(result, Err(StoreError::InvalidTable { .. })));
        assert!(store.get("assets", "A").is_none());
        assert_eq!(store.read(|t| t.crud_len()), 0);
        assert!(store.read(|t| t.bucket(LOCAL_BUCKET).is_none()));
    }

    #[test]
    fn crud_watch_publishes_sequence() {
        let store = LocalStore::open_in_memory().unwrap();
        let rx = store.subscribe_crud();
        assert_eq!(*rx.borrow(), 0);
        store
            .write_transaction(|tx| {
                tx.put("assets", "A", Row::new())?;
                tx.put("assets", "B", Row::new())
            })
            .unwrap();
        assert_eq!(*rx.borrow(), 2);
        assert!(rx.has_changed().unwrap());
    }
}
