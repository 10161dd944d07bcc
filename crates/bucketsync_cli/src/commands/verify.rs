//! Verify command implementation.
//!
//! Checks that the journal replays cleanly and that every materialized row
//! matches the value merged from the oplog. Rows with pending local changes
//! and rows touched by buckets that have received data since their last
//! applied checkpoint are skipped: they are allowed to differ until the
//! next checkpoint is applied.

use super::{print_json, CliResult, Format, Replica};
use bucketsync_protocol::RowKey;
use bucketsync_store::Tables;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Records replayed from the journal.
    pub records: usize,
    /// Bytes after the last valid record.
    pub torn_bytes: u64,
    /// True if replay stopped at a checksum mismatch.
    pub crc_failure: bool,
    /// Why replay stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Checksum of every bucket, recomputed from its stored entries.
    pub checksums: BTreeMap<String, u32>,
    /// Rows compared against the oplog.
    pub rows_checked: usize,
    /// Rows skipped because they are waiting for a checkpoint.
    pub rows_pending: usize,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// True if nothing was found wrong.
    pub fn is_ok(&self) -> bool {
        self.torn_bytes == 0 && !self.crc_failure && self.errors.is_empty()
    }
}

/// Verifies the store at `path`.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    let replica = Replica::load(path)?;
    let scan = replica.store.open_scan();
    let mut result = VerifyResult {
        records: scan.commits + scan.snapshots,
        torn_bytes: scan.torn_bytes,
        crc_failure: scan.crc_failure,
        stop_reason: scan.stop_reason.clone(),
        ..VerifyResult::default()
    };
    replica.store.read(|t| check_rows(t, &mut result));
    Ok(result)
}

fn check_rows(tables: &Tables, result: &mut VerifyResult) {
    result.checksums = tables
        .buckets()
        .map(|(name, _)| (name.to_string(), tables.bucket_checksum(name).value()))
        .collect();

    let mut pending: BTreeSet<RowKey> = tables.updated_rows().clone();
    for (name, record) in tables.buckets() {
        if record.last_applied_op != record.last_op {
            pending.extend(tables.ops(name).map(|(_, op)| op.row_key()));
        }
    }

    let mut indexed = BTreeSet::new();
    for key in tables.indexed_rows() {
        indexed.insert(key.clone());
        if pending.contains(key) {
            result.rows_pending += 1;
            continue;
        }
        result.rows_checked += 1;
        let stored = tables.row(&key.table, &key.id);
        match tables.merged_row(key) {
            Ok(merged) if merged.as_ref() == stored => {}
            Ok(Some(_)) if stored.is_none() => {
                result.errors.push(format!("row {key} is missing"));
            }
            Ok(None) => {
                result.errors.push(format!("row {key} was removed but is still stored"));
            }
            Ok(Some(_)) => {
                result.errors.push(format!("row {key} differs from its oplog value"));
            }
            Err(e) => result.errors.push(format!("row {key}: {e}")),
        }
    }

    for table in tables.table_names() {
        for (id, _) in tables.rows(table) {
            let key = RowKey::new(table, id);
            if !indexed.contains(&key) && !pending.contains(&key) {
                result.errors.push(format!("row {key} has no oplog entry"));
            }
        }
    }
}

/// Runs the verify command.
pub fn run(path: &Path, format: Format) -> CliResult<bool> {
    let result = verify(path)?;
    if format == Format::Json {
        print_json(&result)?;
        return Ok(result.is_ok());
    }

    println!("bucketsync Store Verification");
    println!("=============================");
    println!();
    if result.torn_bytes == 0 && !result.crc_failure {
        println!("✓ Journal: {} records replayed", result.records);
    } else {
        println!(
            "✗ Journal: {} records replayed, {} bytes unreadable{}",
            result.records,
            result.torn_bytes,
            if result.crc_failure { " (checksum mismatch)" } else { "" }
        );
        if let Some(reason) = &result.stop_reason {
            println!("  - {reason}");
        }
    }

    println!("✓ Buckets: {} checksums recomputed", result.checksums.len());
    if result.errors.is_empty() {
        println!(
            "✓ Rows: {} consistent, {} waiting for a checkpoint",
            result.rows_checked, result.rows_pending
        );
    } else {
        println!("✗ Rows: {} problems", result.errors.len());
        for error in &result.errors {
            println!("  - {error}");
        }
    }

    println!();
    if result.is_ok() {
        println!("Verification passed.");
    } else {
        println!("Verification FAILED.");
    }
    Ok(result.is_ok())
}
