//! Crud command implementation: lists queued local writes.

use super::{print_json, CliResult, Format, Replica};
use bucketsync_protocol::CrudEntryOutput;
use std::path::Path;

/// Returns queued writes in upload order.
pub fn collect(path: &Path, limit: Option<usize>) -> CliResult<Vec<CrudEntryOutput>> {
    let replica = Replica::load(path)?;
    Ok(replica.store.read(|t| {
        t.crud()
            .take(limit.unwrap_or(usize::MAX))
            .map(|entry| entry.to_output())
            .collect()
    }))
}

/// Runs the crud command.
pub fn run(path: &Path, limit: Option<usize>, format: Format) -> CliResult<()> {
    let entries = collect(path, limit)?;
    if format == Format::Json {
        return print_json(&entries);
    }

    println!("Upload Queue: {} entries", entries.len());
    println!("============");
    for entry in &entries {
        let tx = entry.tx_id.map(|id| format!(" tx={id}")).unwrap_or_default();
        println!(
            "[{}] {} {}/{}{}",
            entry.op_id,
            entry.op.as_str(),
            entry.table,
            entry.id,
            tx
        );
        if let Some(data) = &entry.data {
            println!("    {}", serde_json::Value::Object(data.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_protocol::UpdateType;
    use bucketsync_store::LocalStore;
    use bucketsync_testkit::{as_row, local_put};
    use serde_json::json;

    #[test]
    fn lists_queue_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = LocalStore::open(&path).unwrap();
            local_put(&store, "notes", "N1", json!({"text": "a"}));
            store
                .write_transaction(|tx| {
                    tx.put("notes", "N2", as_row(json!({"text": "b"})))?;
                    tx.delete("notes", "N1")
                })
                .unwrap();
        }

        let entries = collect(&path, None).unwrap();
        let ops: Vec<_> = entries.iter().map(|e| (e.op, e.id.as_str())).collect();
        assert_eq!(
            ops,
            vec![
                (UpdateType::Put, "N1"),
                (UpdateType::Put, "N2"),
                (UpdateType::Delete, "N1"),
            ]
        );
        assert!(entries[0].op_id < entries[1].op_id);
        assert_eq!(entries[1].tx_id, entries[2].tx_id);
        assert_eq!(collect(&path, Some(1)).unwrap().len(), 1);
    }
}
