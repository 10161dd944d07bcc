//! Download progress towards the target checkpoint.

use bucketsync_protocol::Checkpoint;
use bucketsync_store::BucketOperationProgress;
use std::collections::BTreeMap;

/// Progress of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketProgress {
    /// Bucket priority.
    pub priority: u8,
    /// Op count at the last fully applied checkpoint.
    pub at_last: u64,
    /// Entries received since then.
    pub since_last: u64,
    /// Op count declared by the target checkpoint.
    pub target_count: u64,
}

/// Operation counts for a subset of buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressWithOperations {
    /// Entries the service still had to send when the download started.
    pub total_operations: u64,
    /// Entries received so far.
    pub downloaded_operations: u64,
}

impl ProgressWithOperations {
    /// `downloaded / total`, or 0 when nothing is expected.
    #[must_use]
    pub fn downloaded_fraction(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.downloaded_operations as f64 / self.total_operations as f64
        }
    }
}

/// Per-bucket download progress towards the target checkpoint.
///
/// Totals come from the op counts declared by the checkpoint minus the
/// counts at the last applied checkpoint. Buckets whose declared count is
/// missing contribute nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    buckets: BTreeMap<String, BucketProgress>,
}

impl SyncProgress {
    /// Builds progress for `checkpoint` from the stored download counters.
    ///
    /// If any bucket shrank below what was already received (a compaction
    /// or a redeploy on the service), earlier counters are discarded so the
    /// fraction cannot exceed one.
    pub fn for_checkpoint(
        checkpoint: &Checkpoint,
        stored: &BTreeMap<String, BucketOperationProgress>,
    ) -> Self {
        let mut buckets = BTreeMap::new();
        let mut invalidated = false;
        for declared in &checkpoint.buckets {
            let saved = stored.get(&declared.bucket).copied().unwrap_or_default();
            if declared
                .count
                .is_some_and(|count| count < saved.at_last + saved.since_last)
            {
                invalidated = true;
            }
            buckets.insert(
                declared.bucket.clone(),
                BucketProgress {
                    priority: declared.priority(),
                    at_last: saved.at_last,
                    since_last: saved.since_last,
                    target_count: declared.count.unwrap_or(0),
                },
            );
        }
        if invalidated {
            for progress in buckets.values_mut() {
                progress.at_last = 0;
                progress.since_last = 0;
            }
        }
        Self { buckets }
    }

    /// Records `entries` received for `bucket`. Unknown buckets are ignored.
    pub fn record(&mut self, bucket: &str, entries: u64) {
        if let Some(progress) = self.buckets.get_mut(bucket) {
            progress.since_last += entries;
        }
    }

    /// Progress of one bucket.
    #[must_use]
    pub fn bucket(&self, name: &str) -> Option<&BucketProgress> {
        self.buckets.get(name)
    }

    /// Counts over buckets at `priority` or lower.
    #[must_use]
    pub fn until_priority(&self, priority: u8) -> ProgressWithOperations {
        self.sum(|progress| progress.priority <= priority)
    }

    /// Counts over every bucket.
    #[must_use]
    pub fn until_completion(&self) -> ProgressWithOperations {
        self.sum(|_| true)
    }

    /// Entries still to download across every bucket when the download started.
    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.until_completion().total_operations
    }

    /// Entries received across every bucket.
    #[must_use]
    pub fn downloaded_operations(&self) -> u64 {
        self.until_completion().downloaded_operations
    }

    fn sum(&self, include: impl Fn(&BucketProgress) -> bool) -> ProgressWithOperations {
        self.buckets
            .values()
            .filter(|progress| include(progress))
            .fold(ProgressWithOperations::default(), |acc, progress| {
                ProgressWithOperations {
                    total_operations: acc.total_operations
                        + progress.target_count.saturating_sub(progress.at_last),
                    downloaded_operations: acc.downloaded_operations + progress.since_last,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketsync_protocol::BucketChecksum;

    fn stored(entries: &[(&str, u64, u64)]) -> BTreeMap<String, BucketOperationProgress> {
        entries
            .iter()
            .map(|(name, at_last, since_last)| {
                let progress = BucketOperationProgress {
                    at_last: *at_last,
                    since_last: *since_last,
                };
                (name.to_string(), progress)
            })
            .collect()
    }

    #[test]
    fn totals_subtract_applied_counts() {
        let checkpoint = Checkpoint::new(
            10,
            vec![
                BucketChecksum::new("a", 0).with_count(10).with_priority(0),
                BucketChecksum::new("b", 0).with_count(6),
                BucketChecksum::new("c", 0),
            ],
        );
        let mut progress =
            SyncProgress::for_checkpoint(&checkpoint, &stored(&[("a", 4, 1), ("b", 0, 0)]));
        assert_eq!(progress.total_operations(), 12);
        assert_eq!(progress.downloaded_operations(), 1);

        progress.record("b", 3);
        progress.record("unknown", 100);
        assert_eq!(progress.downloaded_operations(), 4);
        assert_eq!(
            progress.until_priority(0),
            ProgressWithOperations {
                total_operations: 6,
                downloaded_operations: 1,
            }
        );
        assert!((progress.until_completion().downloaded_fraction() - 4.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn shrunken_bucket_resets_counters() {
        let checkpoint = Checkpoint::new(
            10,
            vec![
                BucketChecksum::new("a", 0).with_count(3),
                BucketChecksum::new("b", 0).with_count(8),
            ],
        );
        let progress =
            SyncProgress::for_checkpoint(&checkpoint, &stored(&[("a", 5, 0), ("b", 2, 1)]));
        assert_eq!(progress.bucket("b").unwrap().at_last, 0);
        assert_eq!(progress.total_operations(), 11);
        assert_eq!(progress.downloaded_operations(), 0);
    }

    #[test]
    fn nothing_expected_is_zero_fraction() {
        assert_eq!(SyncProgress::default().until_completion().downloaded_fraction(), 0.0);
    }
}
