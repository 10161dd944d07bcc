//! In-memory tables and the mutations that change them.
//!
//! Every change to [`Tables`] is expressed as a [`Mutation`]. Applying a
//! mutation returns its inverse, which is what write transactions keep as
//! their undo log; the forward mutations are what the journal persists.

use crate::error::{StoreError, StoreResult};
use bucketsync_protocol::{Checksum, CrudEntry, OpId, OpType, RowKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A materialized row: a JSON object that always carries `"id"`.
pub type Row = Map<String, Value>;

/// Progress record for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Highest op id known for this bucket.
    pub last_op: OpId,
    /// Op id the bucket must reach before its data may be applied.
    pub target_op: OpId,
    /// Checksums folded in from entries that are no longer stored.
    pub add_checksum: Checksum,
    /// Op id up to which the bucket's entries are materialized.
    pub last_applied_op: OpId,
    /// Tombstone or `$local`: excluded from cursors, deleted once caught up.
    pub pending_delete: bool,
    /// Op count declared by the last fully applied checkpoint.
    #[serde(default)]
    pub count_at_last: u64,
    /// Entries received since the last fully applied checkpoint.
    #[serde(default)]
    pub count_since_last: u64,
}

/// A stored `PUT` or `REMOVE` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// `PUT` or `REMOVE`.
    pub op: OpType,
    /// Table of the affected row.
    pub object_type: String,
    /// Id of the affected row.
    pub object_id: String,
    /// Row part this entry versions.
    pub subkey: Option<String>,
    /// Checksum contribution.
    pub checksum: Checksum,
    /// Payload JSON text for `PUT`.
    pub data: Option<String>,
    /// A later entry in the same bucket replaced this one.
    pub superseded: bool,
}

impl StoredOp {
    /// Returns the row this entry targets.
    #[must_use]
    pub fn row_key(&self) -> RowKey {
        RowKey::new(&self.object_type, &self.object_id)
    }

    fn slot(&self, bucket: &str) -> Slot {
        (bucket.to_string(), self.subkey.clone())
    }
}

/// Persistent scalar state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Persistent client id, created on first use.
    pub client_id: Option<String>,
    /// Last CRUD id handed out.
    pub crud_seq: u64,
    /// Next local transaction id.
    pub next_tx_id: u64,
}

/// `(bucket, subkey)` position of a live entry.
type Slot = (String, Option<String>);

/// A single reversible change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Mutation {
    SetBucket {
        name: String,
        value: Option<BucketRecord>,
    },
    SetOp {
        bucket: String,
        op_id: OpId,
        value: Option<StoredOp>,
    },
    SetRow {
        table: String,
        id: String,
        value: Option<Row>,
    },
    SetCrud {
        id: u64,
        value: Option<CrudEntry>,
    },
    SetUpdated {
        key: RowKey,
        present: bool,
    },
    SetMeta(Meta),
}

/// All store state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    buckets: BTreeMap<String, BucketRecord>,
    oplog: BTreeMap<String, BTreeMap<OpId, StoredOp>>,
    rows: BTreeMap<String, BTreeMap<String, Row>>,
    crud: BTreeMap<u64, CrudEntry>,
    updated_rows: BTreeSet<RowKey>,
    meta: Meta,
    /// Live (non-superseded) entries per row. Derived, never persisted.
    #[serde(skip)]
    live: BTreeMap<RowKey, BTreeMap<Slot, OpId>>,
}

impl Tables {
    /// Applies a mutation and returns the mutation that undoes it.
    pub(crate) fn apply(&mut self, mutation: Mutation) -> Mutation {
        match mutation {
            Mutation::SetBucket { name, value } => {
                let previous = match value {
                    Some(record) => self.buckets.insert(name.clone(), record),
                    None => self.buckets.remove(&name),
                };
                Mutation::SetBucket {
                    name,
                    value: previous,
                }
            }
            Mutation::SetOp {
                bucket,
                op_id,
                value,
            } => {
                let ops = self.oplog.entry(bucket.clone()).or_default();
                let previous = match &value {
                    Some(op) => ops.insert(op_id, op.clone()),
                    None => ops.remove(&op_id),
                };
                if ops.is_empty() {
                    self.oplog.remove(&bucket);
                }
                if let Some(old) = &previous {
                    self.unindex(&bucket, op_id, old);
                }
                if let Some(new) = &value {
                    self.index(&bucket, op_id, new);
                }
                Mutation::SetOp {
                    bucket,
                    op_id,
                    value: previous,
                }
            }
            Mutation::SetRow { table, id, value } => {
                let rows = self.rows.entry(table.clone()).or_default();
                let previous = match value {
                    Some(row) => rows.insert(id.clone(), row),
                    None => rows.remove(&id),
                };
                if rows.is_empty() {
                    self.rows.remove(&table);
                }
                Mutation::SetRow {
                    table,
                    id,
                    value: previous,
                }
            }
            Mutation::SetCrud { id, value } => {
                let previous = match value {
                    Some(entry) => self.crud.insert(id, entry),
                    None => self.crud.remove(&id),
                };
                Mutation::SetCrud {
                    id,
                    value: previous,
                }
            }
            Mutation::SetUpdated { key, present } => {
                let was_present = if present {
                    !self.updated_rows.insert(key.clone())
                } else {
                    self.updated_rows.remove(&key)
                };
                Mutation::SetUpdated {
                    key,
                    present: was_present,
                }
            }
            Mutation::SetMeta(meta) => Mutation::SetMeta(std::mem::replace(&mut self.meta, meta)),
        }
    }

    fn index(&mut self, bucket: &str, op_id: OpId, op: &StoredOp) {
        if op.superseded {
            return;
        }
        self.live
            .entry(op.row_key())
            .or_default()
            .insert(op.slot(bucket), op_id);
    }

    fn unindex(&mut self, bucket: &str, op_id: OpId, op: &StoredOp) {
        if op.superseded {
            return;
        }
        let key = op.row_key();
        if let Some(slots) = self.live.get_mut(&key) {
            let slot = op.slot(bucket);
            if slots.get(&slot) == Some(&op_id) {
                slots.remove(&slot);
            }
            if slots.is_empty() {
                self.live.remove(&key);
            }
        }
    }

    /// Rebuilds the live index from the oplog.
    pub(crate) fn rebuild_index(&mut self) {
        let mut live: BTreeMap<RowKey, BTreeMap<Slot, OpId>> = BTreeMap::new();
        for (bucket, ops) in &self.oplog {
            for (op_id, op) in ops.iter().filter(|(_, op)| !op.superseded) {
                live.entry(op.row_key())
                    .or_default()
                    .insert(op.slot(bucket), *op_id);
            }
        }
        self.live = live;
    }

    /// Iterates over all buckets, ordered by name.
    pub fn buckets(&self) -> impl Iterator<Item = (&str, &BucketRecord)> {
        self.buckets.iter().map(|(name, record)| (name.as_str(), record))
    }

    /// Returns one bucket's record.
    #[must_use]
    pub fn bucket(&self, name: &str) -> Option<&BucketRecord> {
        self.buckets.get(name)
    }

    /// Iterates over a bucket's stored entries in op id order.
    pub fn ops<'a>(&'a self, bucket: &str) -> impl Iterator<Item = (OpId, &'a StoredOp)> + 'a {
        self.oplog
            .get(bucket)
            .into_iter()
            .flat_map(|ops| ops.iter().map(|(id, op)| (*id, op)))
    }

    /// Returns a bucket's stored entries after `after`, in op id order.
    pub fn ops_after<'a>(
        &'a self,
        bucket: &str,
        after: OpId,
    ) -> impl Iterator<Item = (OpId, &'a StoredOp)> + 'a {
        self.ops(bucket).filter(move |(id, _)| *id > after)
    }

    /// Returns one stored entry.
    #[must_use]
    pub fn op(&self, bucket: &str, op_id: OpId) -> Option<&StoredOp> {
        self.oplog.get(bucket).and_then(|ops| ops.get(&op_id))
    }

    /// Total number of stored entries.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.oplog.values().map(BTreeMap::len).sum()
    }

    /// Local checksum of a bucket: folded checksums plus every stored entry.
    #[must_use]
    pub fn bucket_checksum(&self, name: &str) -> Checksum {
        let folded = self
            .buckets
            .get(name)
            .map_or(Checksum::ZERO, |record| record.add_checksum);
        folded + self.ops(name).map(|(_, op)| op.checksum).sum::<Checksum>()
    }

    /// Returns the live entry for a row part in one bucket.
    pub(crate) fn live_op(&self, key: &RowKey, bucket: &str, subkey: Option<&str>) -> Option<OpId> {
        let slot = (bucket.to_string(), subkey.map(str::to_string));
        self.live.get(key).and_then(|slots| slots.get(&slot)).copied()
    }

    /// Returns the entry that decides a row's merged value: the highest-op-id
    /// live `PUT` across every bucket and subkey.
    #[must_use]
    pub fn winning_put(&self, key: &RowKey) -> Option<(&str, OpId, &StoredOp)> {
        self.winning_put_where(key, |_, _| true)
    }

    /// Like [`Tables::winning_put`], considering only the live entries
    /// accepted by `visible`.
    pub fn winning_put_where(
        &self,
        key: &RowKey,
        visible: impl Fn(&str, OpId) -> bool,
    ) -> Option<(&str, OpId, &StoredOp)> {
        let slots = self.live.get(key)?;
        slots
            .iter()
            .filter(|((bucket, _), op_id)| visible(bucket.as_str(), **op_id))
            .filter_map(|((bucket, _), op_id)| {
                self.op(bucket, *op_id)
                    .filter(|op| op.op == OpType::Put)
                    .map(|op| (bucket.as_str(), *op_id, op))
            })
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
    }

    /// Computes the merged value of a row from the oplog alone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRowData`] if the winning payload is not a
    /// JSON object.
    pub fn merged_row(&self, key: &RowKey) -> StoreResult<Option<Row>> {
        self.merged_row_where(key, |_, _| true)
    }

    /// Computes a row's merged value from the live entries accepted by `visible`.
    ///
    /// # Errors
    ///
    /// Same as [`Tables::merged_row`].
    pub fn merged_row_where(
        &self,
        key: &RowKey,
        visible: impl Fn(&str, OpId) -> bool,
    ) -> StoreResult<Option<Row>> {
        match self.winning_put_where(key, visible) {
            Some((_, _, op)) => row_from_payload(key, op.data.as_deref()).map(Some),
            None => Ok(None),
        }
    }

    /// Returns a materialized row.
    #[must_use]
    pub fn row(&self, table: &str, id: &str) -> Option<&Row> {
        self.rows.get(table).and_then(|rows| rows.get(id))
    }

    /// Iterates over the rows of a table, ordered by id.
    pub fn rows<'a>(&'a self, table: &str) -> impl Iterator<Item = (&'a str, &'a Row)> + 'a {
        self.rows
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(id, row)| (id.as_str(), row)))
    }

    /// Names of tables holding at least one row.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    /// Total number of materialized rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    /// Iterates over queued CRUD entries in upload order.
    pub fn crud(&self) -> impl Iterator<Item = &CrudEntry> {
        self.crud.values()
    }

    /// Number of queued CRUD entries.
    #[must_use]
    pub fn crud_len(&self) -> usize {
        self.crud.len()
    }

    /// Rows changed locally or by a `CLEAR` and not yet re-merged.
    #[must_use]
    pub fn updated_rows(&self) -> &BTreeSet<RowKey> {
        &self.updated_rows
    }

    /// Persistent scalar state.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// All row keys with stored entries, for consistency checks.
    pub fn indexed_rows(&self) -> impl Iterator<Item = &RowKey> {
        self.live.keys()
    }
}

/// Parses a `PUT` payload into a row carrying `"id"`.
pub(crate) fn row_from_payload(key: &RowKey, data: Option<&str>) -> StoreResult<Row> {
    let invalid = || StoreError::InvalidRowData {
        object_type: key.table.clone(),
        object_id: key.id.clone(),
    };
    let value: Value = serde_json::from_str(data.unwrap_or("{}")).map_err(|_| invalid())?;
    let Value::Object(mut row) = value else {
        return Err(invalid());
    };
    row.insert("id".into(), Value::String(key.id.clone()));
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(table: &str, id: &str, data: &str, checksum: u32) -> StoredOp {
        StoredOp {
            op: OpType::Put,
            object_type: table.into(),
            object_id: id.into(),
            subkey: None,
            checksum: Checksum::new(checksum),
            data: Some(data.into()),
            superseded: false,
        }
    }

    #[test]
    fn inverse_restores_previous_state() {
        let mut tables = Tables::default();
        let undo = tables.apply(Mutation::SetBucket {
            name: "b".into(),
            value: Some(BucketRecord::default()),
        });
        assert!(tables.bucket("b").is_some());
        tables.apply(undo);
        assert!(tables.bucket("b").is_none());

        let undo = tables.apply(Mutation::SetUpdated {
            key: RowKey::new("t", "1"),
            present: true,
        });
        assert_eq!(tables.updated_rows().len(), 1);
        tables.apply(undo);
        assert!(tables.updated_rows().is_empty());
    }

    #[test]
    fn index_follows_supersede_and_undo() {
        let mut tables = Tables::default();
        let key = RowKey::new("assets", "O1");
        tables.apply(Mutation::SetOp {
            bucket: "b".into(),
            op_id: OpId::new(1),
            value: Some(put("assets", "O1", "{}", 1)),
        });
        assert_eq!(tables.live_op(&key, "b", None), Some(OpId::new(1)));

        let mut old = put("assets", "O1", "{}", 1);
        old.superseded = true;
        let undo_old = tables.apply(Mutation::SetOp {
            bucket: "b".into(),
            op_id: OpId::new(1),
            value: Some(old),
        });
        let undo_new = tables.apply(Mutation::SetOp {
            bucket: "b".into(),
            op_id: OpId::new(3),
            value: Some(put("assets", "O1", r#"{"d":3}"#, 3)),
        });
        assert_eq!(tables.live_op(&key, "b", None), Some(OpId::new(3)));

        tables.apply(undo_new);
        tables.apply(undo_old);
        assert_eq!(tables.live_op(&key, "b", None), Some(OpId::new(1)));
    }

    #[test]
    fn winning_put_takes_highest_op_across_buckets() {
        let mut tables = Tables::default();
        tables.apply(Mutation::SetOp {
            bucket: "a".into(),
            op_id: OpId::new(3),
            value: Some(put("assets", "O1", r#"{"d":"bard"}"#, 3)),
        });
        tables.apply(Mutation::SetOp {
            bucket: "b".into(),
            op_id: OpId::new(1),
            value: Some(put("assets", "O1", r#"{"d":"bar"}"#, 1)),
        });
        let row = tables.merged_row(&RowKey::new("assets", "O1")).unwrap().unwrap();
        assert_eq!(row.get("d"), Some(&json!("bard")));
        assert_eq!(row.get("id"), Some(&json!("O1")));
    }

    #[test]
    fn checksum_includes_folded_value() {
        let mut tables = Tables::default();
        tables.apply(Mutation::SetBucket {
            name: "b".into(),
            value: Some(BucketRecord {
                add_checksum: Checksum::new(u32::MAX),
                ..BucketRecord::default()
            }),
        });
        tables.apply(Mutation::SetOp {
            bucket: "b".into(),
            op_id: OpId::new(1),
            value: Some(put("t", "1", "{}", 2)),
        });
        assert_eq!(tables.bucket_checksum("b"), Checksum::new(1));
        assert_eq!(tables.bucket_checksum("missing"), Checksum::ZERO);
    }

    #[test]
    fn rebuild_matches_incremental_index() {
        let mut tables = Tables::default();
        tables.apply(Mutation::SetOp {
            bucket: "b".into(),
            op_id: OpId::new(2),
            value: Some(put("t", "x", "{}", 2)),
        });
        let before = tables.live.clone();
        tables.rebuild_index();
        assert_eq!(tables.live, before);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let key = RowKey::new("t", "1");
        assert!(matches!(
            row_from_payload(&key, Some("[1,2]")),
            Err(StoreError::InvalidRowData { .. })
        ));
        assert!(row_from_payload(&key, Some("not json")).is_err());
        assert_eq!(
            row_from_payload(&key, Some(r#"{"a":1}"#)).unwrap(),
            json!({"a": 1, "id": "1"}).as_object().cloned().unwrap()
        );
    }
}
