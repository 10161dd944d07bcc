//! Property-based test generators using proptest.
//!
//! Provides strategies for oplog data that keeps the invariants the
//! server guarantees: op ids strictly increase within a bucket and every
//! data entry names a table and an id.

use crate::builders::{put, remove};
use bucketsync_protocol::{OpId, OplogEntry};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for op ids as sent on the wire.
pub fn op_id_strategy() -> impl Strategy<Value = OpId> {
    (0u64..=i64::MAX as u64).prop_map(OpId::new)
}

/// Strategy for valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for small row payloads.
pub fn row_data_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..4).prop_map(|columns| {
        Value::Object(columns.into_iter().map(|(k, v)| (k, json!(v))).collect())
    })
}

/// Strategy for one bucket's entries touching `objects` ids of `table`.
///
/// Op ids are strictly increasing and drawn from `1..=max_op`. Each entry is
/// a `PUT` or a `REMOVE` of `O<n>`, with the op id as checksum.
pub fn bucket_entries_strategy(
    table: &'static str,
    objects: u8,
    max_op: u64,
) -> impl Strategy<Value = Vec<OplogEntry>> {
    prop::collection::btree_map(1..=max_op, (0..objects.max(1), any::<bool>()), 0..12).prop_map(
        move |ops| {
            ops.into_iter()
                .map(|(op_id, (object, is_put))| {
                    let id = format!("O{object}");
                    if is_put {
                        put(op_id, table, &id, json!({ "v": op_id }))
                    } else {
                        remove(op_id, table, &id)
                    }
                })
                .collect()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn bucket_entries_are_ordered(entries in bucket_entries_strategy("assets", 4, 40)) {
            for pair in entries.windows(2) {
                prop_assert!(pair[0].op_id < pair[1].op_id);
            }
            for entry in &entries {
                prop_assert_eq!(entry.checksum.value() as u64, entry.op_id.as_u64());
                prop_assert!(entry.row_key().is_some());
            }
        }

        #[test]
        fn row_data_is_an_object(data in row_data_strategy()) {
            prop_assert!(data.is_object());
        }

        #[test]
        fn generated_tables_accept_local_writes(table in table_name_strategy(), data in row_data_strategy()) {
            let store = crate::fixtures::TestStore::memory();
            crate::fixtures::local_put(&store, &table, "O1", data);
            prop_assert!(store.get(&table, "O1").is_some());
        }

        #[test]
        fn op_ids_fit_the_wire(op_id in op_id_strategy()) {
            let text = op_id.to_string();
            prop_assert_eq!(text.parse::<OpId>().unwrap(), op_id);
        }
    }
}
