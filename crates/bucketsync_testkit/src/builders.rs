//! Builders for oplog entries, checkpoints and sync lines.
//!
//! Checksums of built entries default to their op id, so a bucket's
//! expected checksum is the wrapping sum of its op ids.

use bucketsync_protocol::{
    BucketChecksum, Checkpoint, CheckpointComplete, CheckpointDiff, Checksum, OpId, OplogEntry,
    PartialCheckpointComplete, StreamingSyncLine, SyncDataBucket,
};
use serde_json::Value;

/// A `PUT` of `data` with checksum equal to `op_id`.
pub fn put(op_id: u64, table: &str, id: &str, data: Value) -> OplogEntry {
    OplogEntry::put(op_id, table, id, data.to_string(), op_id as u32)
}

/// A `REMOVE` with checksum equal to `op_id`.
pub fn remove(op_id: u64, table: &str, id: &str) -> OplogEntry {
    OplogEntry::remove(op_id, table, id, op_id as u32)
}

/// Wrapping sum of the checksums of `entries`.
pub fn bucket_checksum(entries: &[OplogEntry]) -> u32 {
    entries.iter().map(|e| e.checksum).sum::<Checksum>().value()
}

/// A checkpoint declaring each bucket's checksum over its entries.
pub fn checkpoint_for(last_op_id: u64, buckets: &[(&str, &[OplogEntry])]) -> Checkpoint {
    Checkpoint::new(
        last_op_id,
        buckets
            .iter()
            .map(|(name, entries)| BucketChecksum::new(*name, bucket_checksum(entries)))
            .collect(),
    )
}

/// Like [`checkpoint_for`], also declaring each bucket's op count.
pub fn counted_checkpoint_for(last_op_id: u64, buckets: &[(&str, &[OplogEntry])]) -> Checkpoint {
    let mut checkpoint = checkpoint_for(last_op_id, buckets);
    for (declared, (_, entries)) in checkpoint.buckets.iter_mut().zip(buckets) {
        declared.count = Some(entries.len() as u64);
    }
    checkpoint
}

/// Sets the priority of `bucket` in `checkpoint`.
pub fn with_priority(mut checkpoint: Checkpoint, bucket: &str, priority: u8) -> Checkpoint {
    for declared in checkpoint.buckets.iter_mut().filter(|b| b.bucket == bucket) {
        declared.priority = Some(priority);
    }
    checkpoint
}

/// A checkpoint from explicit `(bucket, checksum)` pairs.
pub fn checkpoint(last_op_id: u64, buckets: &[(&str, u32)]) -> Checkpoint {
    Checkpoint::new(
        last_op_id,
        buckets
            .iter()
            .map(|(name, checksum)| BucketChecksum::new(*name, *checksum))
            .collect(),
    )
}

/// A `checkpoint` line.
pub fn checkpoint_line(checkpoint: Checkpoint) -> StreamingSyncLine {
    StreamingSyncLine::Checkpoint(checkpoint)
}

/// A `checkpoint_diff` line.
pub fn diff_line(
    last_op_id: u64,
    updated: &[(&str, u32)],
    removed: &[&str],
) -> StreamingSyncLine {
    StreamingSyncLine::CheckpointDiff(CheckpointDiff {
        last_op_id: OpId::new(last_op_id),
        updated_buckets: updated
            .iter()
            .map(|(name, checksum)| BucketChecksum::new(*name, *checksum))
            .collect(),
        removed_buckets: removed.iter().map(|name| name.to_string()).collect(),
        write_checkpoint: None,
    })
}

/// A `data` line for `bucket`.
pub fn data_line(bucket: &str, entries: Vec<OplogEntry>) -> StreamingSyncLine {
    StreamingSyncLine::Data(SyncDataBucket::new(bucket, entries))
}

/// A `checkpoint_complete` line.
pub fn complete_line(last_op_id: u64) -> StreamingSyncLine {
    StreamingSyncLine::CheckpointComplete(CheckpointComplete {
        last_op_id: OpId::new(last_op_id),
    })
}

/// A `partial_checkpoint_complete` line.
pub fn partial_line(last_op_id: u64, priority: u8) -> StreamingSyncLine {
    StreamingSyncLine::PartialCheckpointComplete(PartialCheckpointComplete {
        last_op_id: OpId::new(last_op_id),
        priority,
    })
}

/// A line with only unrecognized fields.
pub fn unknown_line(field: &str) -> StreamingSyncLine {
    StreamingSyncLine::Unknown {
        fields: vec![field.to_string()],
    }
}

/// A keepalive line.
pub fn keepalive_line(token_expires_in: i64) -> StreamingSyncLine {
    StreamingSyncLine::KeepAlive { token_expires_in }
}

/// Lines for one complete checkpoint: the checkpoint, one data line per
/// bucket, and `checkpoint_complete`.
pub fn full_sync(last_op_id: u64, buckets: &[(&str, &[OplogEntry])]) -> Vec<StreamingSyncLine> {
    let mut lines = vec![checkpoint_line(checkpoint_for(last_op_id, buckets))];
    lines.extend(
        buckets
            .iter()
            .map(|(name, entries)| data_line(name, entries.to_vec())),
    );
    lines.push(complete_line(last_op_id));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksums_sum_op_ids() {
        let entries = [put(1, "t", "a", json!({})), remove(2, "t", "a")];
        assert_eq!(bucket_checksum(&entries), 3);

        let cp = checkpoint_for(2, &[("b1", &entries), ("b2", &[])]);
        assert_eq!(cp.buckets[0].checksum, Checksum::new(3));
        assert_eq!(cp.buckets[1].checksum, Checksum::ZERO);
    }

    #[test]
    fn counted_checkpoint_with_priority() {
        let entries = [put(1, "t", "a", json!({})), put(2, "t", "b", json!({}))];
        let cp = with_priority(
            counted_checkpoint_for(2, &[("b1", &entries), ("b2", &[])]),
            "b2",
            0,
        );
        assert_eq!(cp.buckets[0].count, Some(2));
        assert_eq!(cp.buckets[0].priority(), 3);
        assert_eq!(cp.buckets[1].count, Some(0));
        assert_eq!(cp.buckets[1].priority(), 0);
    }

    #[test]
    fn full_sync_line_order() {
        let entries = [put(1, "t", "a", json!({"x": 1}))];
        let kinds: Vec<_> = full_sync(1, &[("b1", &entries)])
            .iter()
            .map(|l| l.kind())
            .collect();
        assert_eq!(kinds, vec!["checkpoint", "data", "checkpoint_complete"]);
    }
}
