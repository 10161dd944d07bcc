//! Store configuration.

/// Configuration for opening a [`crate::LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to fsync the journal on every commit.
    pub sync_on_commit: bool,

    /// Journal size in bytes above which it is rewritten as a single snapshot.
    pub snapshot_threshold: u64,

    /// Number of saved oplog entries between superseded-entry compactions.
    pub compact_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            snapshot_threshold: 4 * 1024 * 1024, // 4 MiB
            compact_interval: 1000,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to fsync on every commit.
    #[must_use]
    pub const fn with_sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the snapshot threshold.
    #[must_use]
    pub const fn with_snapshot_threshold(mut self, bytes: u64) -> Self {
        self.snapshot_threshold = bytes;
        self
    }

    /// Sets the compaction interval.
    #[must_use]
    pub const fn with_compact_interval(mut self, ops: u64) -> Self {
        self.compact_interval = ops;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert!(config.sync_on_commit);
        assert_eq!(config.snapshot_threshold, 4 * 1024 * 1024);
        assert_eq!(config.compact_interval, 1000);
    }

    #[test]
    fn builder() {
        let config = StoreConfig::new()
            .with_sync_on_commit(false)
            .with_snapshot_threshold(512)
            .with_compact_interval(3);
        assert!(!config.sync_on_commit);
        assert_eq!(config.snapshot_threshold, 512);
        assert_eq!(config.compact_interval, 3);
    }
}
