//! Sync engine state and counters.

use chrono::{DateTime, Utc};

/// Where the streaming loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No session is running.
    #[default]
    Disconnected,
    /// Waiting for the sync lock or for the stream to open.
    Connecting,
    /// The stream is open and no checkpoint is in flight.
    Streaming,
    /// A target checkpoint was received and its data is arriving.
    CheckpointPending,
    /// The target checkpoint passed validation but could not be applied yet.
    CheckpointValidated,
    /// The target checkpoint is applied to the local rows.
    CheckpointApplied,
    /// Waiting before the next attempt after a failed iteration.
    RetryWait,
}

impl SyncState {
    /// Returns true while a stream is open.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            SyncState::Streaming
                | SyncState::CheckpointPending
                | SyncState::CheckpointValidated
                | SyncState::CheckpointApplied
        )
    }
}

/// Counters accumulated over the lifetime of an engine.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Streaming iterations started.
    pub iterations: u64,
    /// Sync lines received.
    pub lines_received: u64,
    /// Oplog entries saved.
    pub entries_received: u64,
    /// Checkpoints applied to the local rows.
    pub checkpoints_applied: u64,
    /// Partial checkpoints applied to the local rows.
    pub partial_checkpoints_applied: u64,
    /// Checkpoints rejected by checksum validation.
    pub checksum_failures: u64,
    /// Iterations that failed and were retried.
    pub retries: u64,
    /// Successful `upload_data` calls.
    pub uploads: u64,
    /// Failed upload attempts.
    pub upload_failures: u64,
    /// When a checkpoint was last applied.
    pub last_applied_at: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_states() {
        assert!(!SyncState::Disconnected.is_streaming());
        assert!(!SyncState::Connecting.is_streaming());
        assert!(!SyncState::RetryWait.is_streaming());
        assert!(SyncState::Streaming.is_streaming());
        assert!(SyncState::CheckpointValidated.is_streaming());
        assert_eq!(SyncState::default(), SyncState::Disconnected);
    }
}
