//! Checkpoints and bucket checksums.

use crate::checksum::Checksum;
use crate::op_id::OpId;
use serde::{Deserialize, Serialize};

/// The server's declared checksum for one bucket as of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketChecksum {
    /// Bucket name.
    pub bucket: String,
    /// Additive checksum of every op since the bucket's last `CLEAR`.
    pub checksum: Checksum,
    /// Number of ops covered, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Sync priority; lower values are applied first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

/// Priority assumed for buckets that do not declare one.
pub const DEFAULT_PRIORITY: u8 = 3;

impl BucketChecksum {
    /// Creates a bucket checksum without a count or priority.
    pub fn new(bucket: impl Into<String>, checksum: u32) -> Self {
        Self {
            bucket: bucket.into(),
            checksum: Checksum::new(checksum),
            count: None,
            priority: None,
        }
    }

    /// Sets the op count.
    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// The declared priority, or [`DEFAULT_PRIORITY`].
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Whether this bucket takes part in a sync at `priority`.
    ///
    /// `None` means a full sync, which includes every bucket.
    #[must_use]
    pub fn included_at(&self, priority: Option<u8>) -> bool {
        priority.is_none_or(|p| self.priority() <= p)
    }
}

/// A consistent snapshot descriptor across buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest op id covered by this checkpoint.
    pub last_op_id: OpId,
    /// Per-bucket checksums.
    pub buckets: Vec<BucketChecksum>,
    /// Op id at which this client's uploaded writes are visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<OpId>,
}

impl Checkpoint {
    /// Creates a checkpoint without a write checkpoint.
    pub fn new(last_op_id: impl Into<OpId>, buckets: Vec<BucketChecksum>) -> Self {
        Self {
            last_op_id: last_op_id.into(),
            buckets,
            write_checkpoint: None,
        }
    }

    /// Sets the write checkpoint.
    #[must_use]
    pub fn with_write_checkpoint(mut self, op_id: impl Into<OpId>) -> Self {
        self.write_checkpoint = Some(op_id.into());
        self
    }

    /// Iterates over the bucket names in declaration order.
    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.bucket.as_str())
    }

    /// Buckets that take part in a sync at `priority`.
    pub fn buckets_at(&self, priority: Option<u8>) -> impl Iterator<Item = &BucketChecksum> {
        self.buckets.iter().filter(move |b| b.included_at(priority))
    }

    /// Applies an incremental diff, producing the new target checkpoint.
    ///
    /// Updated buckets replace existing ones in place, new buckets are
    /// appended, removed buckets are dropped.
    #[must_use]
    pub fn apply_diff(&self, diff: &CheckpointDiff) -> Checkpoint {
        let mut buckets = self.buckets.clone();
        for updated in &diff.updated_buckets {
            match buckets.iter_mut().find(|b| b.bucket == updated.bucket) {
                Some(existing) => *existing = updated.clone(),
                None => buckets.push(updated.clone()),
            }
        }
        buckets.retain(|b| !diff.removed_buckets.contains(&b.bucket));

        Checkpoint {
            last_op_id: diff.last_op_id,
            buckets,
            write_checkpoint: diff.write_checkpoint,
        }
    }
}

/// An incremental update to the previous target checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    /// New highest op id.
    pub last_op_id: OpId,
    /// Buckets added or changed since the previous checkpoint.
    #[serde(default)]
    pub updated_buckets: Vec<BucketChecksum>,
    /// Buckets no longer part of the checkpoint.
    #[serde(default)]
    pub removed_buckets: Vec<String>,
    /// Write checkpoint, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<OpId>,
}
