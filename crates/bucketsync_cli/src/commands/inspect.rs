//! Inspect command implementation.

use super::{format_size, print_json, CliResult, Format, Replica};
use bucketsync_store::LOCAL_BUCKET;
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store directory.
    pub path: String,
    /// Journal file size in bytes.
    pub journal_size: u64,
    /// Commit records in the journal.
    pub commits: usize,
    /// Snapshot records in the journal.
    pub snapshots: usize,
    /// True if the journal replayed to its end.
    pub clean: bool,
    /// Persisted client id, if one was ever assigned.
    pub client_id: Option<String>,
    /// True once any checkpoint has been applied.
    pub has_synced: bool,
    /// Stored oplog entries across all buckets.
    pub op_count: usize,
    /// Materialized rows.
    pub row_count: usize,
    /// Rows changed locally and not yet re-merged.
    pub updated_rows: usize,
    /// Queued local writes.
    pub crud_count: usize,
    /// Approximate size of the queued writes in bytes.
    pub crud_size: u64,
    /// Row count per table.
    pub tables: Vec<TableStats>,
    /// Bucket details, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<BucketStats>>,
}

/// Rows held by one table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Number of rows.
    pub rows: usize,
}

/// State of a single bucket.
#[derive(Debug, Serialize)]
pub struct BucketStats {
    /// Bucket name.
    pub name: String,
    /// Highest op id received.
    pub last_op: u64,
    /// Op id the bucket must reach before the next apply.
    pub target_op: u64,
    /// Op id of the last applied checkpoint.
    pub last_applied_op: u64,
    /// Number of stored entries.
    pub entries: usize,
    /// Checksum over the stored and compacted entries.
    pub checksum: u32,
    /// True for a removed bucket awaiting deletion.
    pub pending_delete: bool,
}

/// Collects inspection data for the store at `path`.
pub fn inspect(path: &Path, show_buckets: bool) -> CliResult<InspectResult> {
    let replica = Replica::load(path)?;
    let store = &replica.store;
    let scan = store.open_scan().clone();
    let queue = store.upload_queue_stats(true)?;

    let mut result = store.read(|t| InspectResult {
        path: path.display().to_string(),
        journal_size: replica.journal_size,
        commits: scan.commits,
        snapshots: scan.snapshots,
        clean: scan.is_clean(),
        client_id: t.meta().client_id.clone(),
        has_synced: false,
        op_count: t.op_count(),
        row_count: t.row_count(),
        updated_rows: t.updated_rows().len(),
        crud_count: queue.count,
        crud_size: queue.size.unwrap_or(0),
        tables: t
            .table_names()
            .map(|name| TableStats {
                name: name.to_string(),
                rows: t.rows(name).count(),
            })
            .collect(),
        buckets: show_buckets.then(|| {
            t.buckets()
                .map(|(name, record)| BucketStats {
                    name: name.to_string(),
                    last_op: record.last_op.as_u64(),
                    target_op: record.target_op.as_u64(),
                    last_applied_op: record.last_applied_op.as_u64(),
                    entries: t.ops(name).count(),
                    checksum: t.bucket_checksum(name).value(),
                    pending_delete: record.pending_delete,
                })
                .collect()
        }),
    });
    result.has_synced = store.has_completed_sync();
    Ok(result)
}

/// Runs the inspect command.
pub fn run(path: &Path, show_buckets: bool, format: Format) -> CliResult<()> {
    let result = inspect(path, show_buckets)?;
    match format {
        Format::Json => print_json(&result),
        Format::Text => {
            print_text_output(&result);
            Ok(())
        }
    }
}

fn print_text_output(result: &InspectResult) {
    println!("bucketsync Store Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!(
        "Client id: {}",
        result.client_id.as_deref().unwrap_or("(not assigned)")
    );
    println!("Synced: {}", if result.has_synced { "yes" } else { "no" });
    println!();
    println!("Journal:");
    println!("  Size:      {}", format_size(result.journal_size));
    println!("  Commits:   {}", result.commits);
    println!("  Snapshots: {}", result.snapshots);
    println!(
        "  State:     {}",
        if result.clean { "clean" } else { "torn tail" }
    );
    println!();
    println!("Data:");
    println!("  Oplog entries: {}", result.op_count);
    println!("  Rows:          {}", result.row_count);
    println!("  Updated rows:  {}", result.updated_rows);
    println!(
        "  Upload queue:  {} entries ({})",
        result.crud_count,
        format_size(result.crud_size)
    );

    if !result.tables.is_empty() {
        println!();
        println!("Tables:");
        for table in &result.tables {
            println!("  {}: {} rows", table.name, table.rows);
        }
    }

    if let Some(buckets) = &result.buckets {
        println!();
        println!("Buckets:");
        for b in buckets {
            let marker = if b.pending_delete {
                " (deleted)"
            } else if b.name == LOCAL_BUCKET {
                " (local)"
            } else {
                ""
            };
            println!(
                "  {}{}: last={} target={} applied={} entries={} checksum={}",
                b.name, marker, b.last_op, b.target_op, b.last_applied_op, b.entries, b.checksum
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_store::LocalStore;
    use bucketsync_testkit::{checkpoint_for, local_put, put, save};
    use serde_json::json;

    #[test]
    fn inspect_reports_synced_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = LocalStore::open(&path).unwrap();
            let entries = vec![
                put(1, "assets", "O1", json!({"make": "acme"})),
                put(2, "assets", "O2", json!({"make": "bolt"})),
            ];
            let checkpoint = checkpoint_for(2, &[("b1", &entries)]);
            save(&store, "b1", entries);
            assert!(store.sync_local_database(&checkpoint, None).unwrap().ready);
            local_put(&store, "notes", "N1", json!({"text": "hi"}));
        }

        let result = inspect(&path, true).unwrap();
        assert!(result.clean);
        assert!(result.has_synced);
        assert_eq!(result.op_count, 2);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.crud_count, 1);
        assert_eq!(result.updated_rows, 1);

        let buckets = result.buckets.unwrap();
        let b1 = buckets.iter().find(|b| b.name == "b1").unwrap();
        assert_eq!(b1.last_applied_op, 2);
        assert_eq!(b1.entries, 2);
        assert_eq!(b1.checksum, 3);
    }

    #[test]
    fn inspect_does_not_need_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let store = LocalStore::open(&path).unwrap();
        local_put(&store, "notes", "N1", json!({}));

        let result = inspect(&path, false).unwrap();
        assert_eq!(result.crud_count, 1);
        assert!(result.buckets.is_none());
        assert!(!result.has_synced);
    }
}
