//! The contract the embedding application implements.

use crate::error::SyncResult;
use async_trait::async_trait;
use bucketsync_store::{BucketStorageAdapter, CrudBatch, CrudTransaction, UploadQueueStats};
use chrono::{DateTime, Utc};

/// Where and how to reach the sync service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base URL of the service, without a trailing slash.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
    /// When the token expires, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Creates credentials without a known expiry.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.into(),
            expires_at: None,
        }
    }

    /// Sets the expiry.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Implemented by the application to authenticate and to forward local
/// writes upstream.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Returns current credentials, or `None` when the user is signed out.
    ///
    /// An error clears any cached credentials.
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>>;

    /// Uploads some or all of the queued writes.
    ///
    /// Implementations pull work from `queue` and call `complete` on each
    /// batch or transaction only after the backend durably accepted it.
    async fn upload_data(&self, queue: CrudQueue<'_>) -> SyncResult<()>;
}

/// Read access to the upload queue handed to [`BackendConnector::upload_data`].
#[derive(Clone, Copy)]
pub struct CrudQueue<'a> {
    storage: &'a dyn BucketStorageAdapter,
    batch_limit: usize,
}

impl<'a> CrudQueue<'a> {
    /// Wraps `storage` with a default batch size.
    pub fn new(storage: &'a dyn BucketStorageAdapter, batch_limit: usize) -> Self {
        Self {
            storage,
            batch_limit,
        }
    }

    /// Returns the transaction at the head of the queue.
    pub fn next_transaction(&self) -> Option<CrudTransaction> {
        self.storage.next_crud_transaction()
    }

    /// Returns a batch of the configured size.
    pub fn batch(&self) -> Option<CrudBatch> {
        self.storage.crud_batch(self.batch_limit)
    }

    /// Returns a batch of at most `limit` entries.
    pub fn batch_with_limit(&self, limit: usize) -> Option<CrudBatch> {
        self.storage.crud_batch(limit)
    }

    /// Returns the queue size.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be serialized for sizing.
    pub fn stats(&self, include_size: bool) -> SyncResult<UploadQueueStats> {
        Ok(self.storage.upload_queue_stats(include_size)?)
    }
}

impl std::fmt::Debug for CrudQueue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrudQueue")
            .field("batch_limit", &self.batch_limit)
            .finish_non_exhaustive()
    }
}
