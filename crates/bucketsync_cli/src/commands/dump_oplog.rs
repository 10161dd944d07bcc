//! Dump-oplog command implementation.

use super::{print_json, CliResult, Format, Replica};
use serde::Serialize;
use std::path::Path;

/// One stored oplog entry.
#[derive(Debug, Serialize)]
pub struct OpRecord {
    /// Bucket holding the entry.
    pub bucket: String,
    /// Op id.
    pub op_id: u64,
    /// Operation type.
    pub op: &'static str,
    /// Table name.
    pub object_type: String,
    /// Row id.
    pub object_id: String,
    /// Row part, if the entry has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subkey: Option<String>,
    /// Entry checksum.
    pub checksum: u32,
    /// True if a newer entry replaced this one.
    pub superseded: bool,
    /// `PUT` payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Collects stored entries, in bucket then op id order.
pub fn collect(path: &Path, bucket: Option<&str>, limit: Option<usize>) -> CliResult<Vec<OpRecord>> {
    let replica = Replica::load(path)?;
    let records = replica.store.read(|t| {
        t.buckets()
            .map(|(name, _)| name)
            .filter(|name| bucket.map_or(true, |wanted| wanted == *name))
            .flat_map(|name| {
                t.ops(name).map(move |(op_id, op)| OpRecord {
                    bucket: name.to_string(),
                    op_id: op_id.as_u64(),
                    op: op.op.as_str(),
                    object_type: op.object_type.clone(),
                    object_id: op.object_id.clone(),
                    subkey: op.subkey.clone(),
                    checksum: op.checksum.value(),
                    superseded: op.superseded,
                    data: op.data.clone(),
                })
            })
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    });
    Ok(records)
}

/// Runs the dump-oplog command.
pub fn run(
    path: &Path,
    bucket: Option<&str>,
    limit: Option<usize>,
    format: Format,
) -> CliResult<()> {
    let records = collect(path, bucket, limit)?;
    if format == Format::Json {
        return print_json(&records);
    }

    println!("Oplog Dump: {} entries", records.len());
    println!("==========");
    for r in &records {
        let part = r.subkey.as_deref().map(|s| format!("#{s}")).unwrap_or_default();
        println!(
            "[{}:{}] {} {}/{}{} checksum={}{}",
            r.bucket,
            r.op_id,
            r.op,
            r.object_type,
            r.object_id,
            part,
            r.checksum,
            if r.superseded { " (superseded)" } else { "" }
        );
        if let Some(data) = &r.data {
            println!("    {data}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_store::LocalStore;
    use bucketsync_testkit::{put, remove, save};
    use serde_json::json;

    #[test]
    fn dump_filters_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = LocalStore::open(&path).unwrap();
            save(&store, "b1", vec![
                put(1, "assets", "O1", json!({"make": "acme"})),
                remove(2, "assets", "O1"),
            ]);
            save(&store, "b2", vec![put(3, "notes", "N1", json!({}))]);
        }

        let all = collect(&path, None, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].bucket, "b1");
        assert!(all[0].superseded);
        assert_eq!(all[1].op, "REMOVE");
        assert!(all[1].data.is_none());

        let b2 = collect(&path, Some("b2"), None).unwrap();
        assert_eq!(b2.len(), 1);
        assert_eq!(b2[0].object_type, "notes");

        assert_eq!(collect(&path, None, Some(2)).unwrap().len(), 2);
    }
}
