//! Compact command implementation.

use super::{format_size, print_json, CliResult, Format, Replica, JOURNAL_FILE};
use bucketsync_protocol::OpType;
use bucketsync_store::{LocalStore, Tables};
use serde::Serialize;
use std::path::Path;

/// Compaction result.
#[derive(Debug, Default, Serialize)]
pub struct CompactResult {
    /// True if nothing was changed.
    pub dry_run: bool,
    /// Superseded entries and applied `REMOVE`s that can be deleted.
    pub reclaimable_entries: usize,
    /// Removed buckets awaiting deletion.
    pub tombstones: usize,
    /// Removed buckets whose removal has been applied and can be deleted.
    pub ready_tombstones: usize,
    /// Journal size before compaction.
    pub size_before: u64,
    /// Journal size after compaction.
    pub size_after: u64,
}

fn plan(tables: &Tables, result: &mut CompactResult) {
    for (name, record) in tables.buckets() {
        result.reclaimable_entries += tables
            .ops(name)
            .filter(|(op_id, op)| {
                op.superseded || (op.op == OpType::Remove && *op_id <= record.last_applied_op)
            })
            .count();
        if record.pending_delete {
            result.tombstones += 1;
            if record.last_applied_op == record.last_op && record.last_op >= record.target_op {
                result.ready_tombstones += 1;
            }
        }
    }
}

/// Compacts the store at `path`, or only reports what would be compacted.
///
/// A real run opens the store, so it fails while another process holds it.
pub fn compact(path: &Path, dry_run: bool) -> CliResult<CompactResult> {
    let replica = Replica::load(path)?;
    let mut result = CompactResult {
        dry_run,
        size_before: replica.journal_size,
        size_after: replica.journal_size,
        ..CompactResult::default()
    };
    replica.store.read(|t| plan(t, &mut result));
    drop(replica);

    if dry_run {
        return Ok(result);
    }

    let store = LocalStore::open(path)?;
    store.force_compact()?;
    result.size_after = store.journal_size()?;
    tracing::info!(
        entries = result.reclaimable_entries,
        tombstones = result.ready_tombstones,
        size_before = result.size_before,
        size_after = result.size_after,
        journal = %path.join(JOURNAL_FILE).display(),
        "store compacted"
    );
    Ok(result)
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool, format: Format) -> CliResult<()> {
    let result = compact(path, dry_run)?;
    if format == Format::Json {
        return print_json(&result);
    }

    println!("bucketsync Store Compaction");
    println!("===========================");
    println!();
    if result.dry_run {
        println!("DRY RUN - no changes will be made");
        println!();
    }
    println!("Reclaimable entries: {}", result.reclaimable_entries);
    println!(
        "Deleted buckets:     {} ({} ready)",
        result.tombstones, result.ready_tombstones
    );
    println!("Journal before:      {}", format_size(result.size_before));
    if !result.dry_run {
        println!("Journal after:       {}", format_size(result.size_after));
        println!();
        println!(
            "Saved {}.",
            format_size(result.size_before.saturating_sub(result.size_after))
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_protocol::OpId;
    use bucketsync_testkit::{checkpoint_for, put, save};
    use serde_json::json;

    fn seed(path: &Path) {
        let store = LocalStore::open(path).unwrap();
        let b1 = vec![put(1, "assets", "O1", json!({"make": "acme"}))];
        let b2 = vec![put(2, "assets", "O2", json!({"make": "bolt"}))];
        let checkpoint = checkpoint_for(2, &[("b1", &b1), ("b2", &b2)]);
        save(&store, "b1", b1);
        save(&store, "b2", b2);
        assert!(store.sync_local_database(&checkpoint, None).unwrap().ready);

        // Newer data for O1 that no checkpoint has applied yet.
        save(&store, "b1", vec![put(3, "assets", "O1", json!({"make": "new"}))]);
        store.remove_buckets(&["b2".to_string()]).unwrap();
    }

    #[test]
    fn dry_run_reports_without_changing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        seed(&path);

        let result = compact(&path, true).unwrap();
        assert_eq!(result.reclaimable_entries, 1);
        assert_eq!(result.tombstones, 1);
        assert_eq!(result.ready_tombstones, 0);
        assert_eq!(result.size_after, result.size_before);

        let again = compact(&path, true).unwrap();
        assert_eq!(again.reclaimable_entries, 1);
    }

    #[test]
    fn compaction_keeps_bucket_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        seed(&path);

        let result = compact(&path, false).unwrap();
        assert!(!result.dry_run);

        let store = LocalStore::open(&path).unwrap();
        store.read(|t| {
            assert_eq!(t.ops("b1").count(), 1);
            assert!(t.op("b1", OpId::new(3)).is_some());
            assert_eq!(t.bucket_checksum("b1").value(), 4);
        });
        assert_eq!(store.open_scan().snapshots, 1);
        assert_eq!(store.open_scan().commits, 0);
    }
}
