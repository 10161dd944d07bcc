//! The streaming loop and the upload loop.
//!
//! One streaming iteration holds the SYNC lock, opens a stream from the
//! current bucket cursors and dispatches lines until the stream ends, a
//! checksum failure asks for fresh cursors, or the token runs out. The outer
//! loop retries failed iterations after the configured delay.
//!
//! Upload passes hold the CRUD lock and drain the queue through the
//! connector, then move the `$local` target to a fresh write checkpoint.

use crate::cancel::CancelToken;
use crate::connector::{BackendConnector, CrudQueue};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockManager, LockType};
use crate::progress::SyncProgress;
use crate::remote::Remote;
use crate::state::{SyncState, SyncStats};
use crate::status::StatusObserver;
use crate::throttle::ThrottleHandle;
use crate::transport::Transport;
use bucketsync_protocol::{
    BucketRequest, Checkpoint, CheckpointDiff, StreamingSyncLine, StreamingSyncRequest,
    SyncDataBatch, SyncDataBucket,
};
use bucketsync_store::BucketStorageAdapter;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Everything the background tasks of an engine share.
pub(crate) struct Shared {
    pub(crate) storage: Arc<dyn BucketStorageAdapter>,
    pub(crate) connector: Arc<dyn BackendConnector>,
    pub(crate) remote: Arc<Remote>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) config: SyncConfig,
    pub(crate) status: Arc<StatusObserver>,
    pub(crate) state: RwLock<SyncState>,
    pub(crate) stats: RwLock<SyncStats>,
}

impl Shared {
    pub(crate) fn set_state(&self, state: SyncState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::trace!(from = ?*current, to = ?state, "sync state");
            *current = state;
        }
    }

    fn record(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.write());
    }
}

/// Runs `future` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancelToken,
    future: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    tokio::select! {
        result = future => result,
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
    }
}

async fn sleep(cancel: &CancelToken, delay: Duration) -> SyncResult<()> {
    cancellable(cancel, async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}

/// Keeps one sync stream running until `cancel` fires.
pub(crate) async fn streaming_loop(shared: Arc<Shared>, uploads: ThrottleHandle, cancel: CancelToken) {
    let mut attempt = 0u32;
    while !cancel.is_cancelled() {
        let result = Iteration::new(&shared, &uploads, &cancel).run().await;
        let err = match result {
            Ok(()) => {
                attempt = 0;
                continue;
            }
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => break,
            Err(err) => err,
        };

        if matches!(err, SyncError::Storage(_)) {
            tracing::error!(error = %err, "sync iteration failed on local storage");
        } else if err.is_retryable() {
            tracing::warn!(error = %err, attempt, "sync iteration failed, retrying");
        } else {
            tracing::warn!(error = %err, attempt, "sync iteration failed");
        }
        shared.record(|stats| {
            stats.retries += 1;
            stats.last_error = Some(err.to_string());
        });
        shared.status.update(|status| {
            status.connected = false;
            status.connecting = false;
            status.data_flow.downloading = false;
            status.data_flow.download_error = Some(err.to_string());
            status.data_flow.download_progress = None;
        });
        shared.set_state(SyncState::RetryWait);

        let delay = shared.config.retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        if sleep(&cancel, delay).await.is_err() {
            break;
        }
    }
    tracing::debug!("streaming loop stopped");
}

enum Flow {
    Continue,
    Restart,
}

/// State of one streaming iteration.
struct Iteration<'a> {
    shared: &'a Shared,
    uploads: &'a ThrottleHandle,
    cancel: &'a CancelToken,
    bucket_set: BTreeSet<String>,
    target: Option<Checkpoint>,
    validated: Option<Checkpoint>,
    applied: Option<Checkpoint>,
}

impl<'a> Iteration<'a> {
    fn new(shared: &'a Shared, uploads: &'a ThrottleHandle, cancel: &'a CancelToken) -> Self {
        Self {
            shared,
            uploads,
            cancel,
            bucket_set: BTreeSet::new(),
            target: None,
            validated: None,
            applied: None,
        }
    }

    async fn run(mut self) -> SyncResult<()> {
        self.shared.set_state(SyncState::Connecting);
        self.shared.status.update(|status| status.connecting = true);
        let _lock = self
            .shared
            .locks
            .acquire(LockType::Sync, self.cancel)
            .await?;
        self.shared.record(|stats| stats.iterations += 1);

        let request = self.request()?;
        tracing::debug!(buckets = request.buckets.len(), "opening sync stream");
        let mut stream = cancellable(
            self.cancel,
            self.shared.transport.open_stream(&request, self.cancel),
        )
        .await?;

        self.shared.status.update(|status| {
            status.connected = true;
            status.connecting = false;
            status.data_flow.download_error = None;
        });
        self.shared.set_state(SyncState::Streaming);
        tracing::info!("sync stream connected");
        self.uploads.trigger();

        loop {
            let line = tokio::select! {
                line = stream.next() => line,
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            };
            let Some(line) = line else {
                return Err(SyncError::transport_retryable("sync stream ended"));
            };
            let line = line?;
            self.shared.record(|stats| stats.lines_received += 1);
            tracing::debug!(kind = line.kind(), "sync line");
            if let Flow::Restart = self.dispatch(line).await? {
                return Ok(());
            }
        }
    }

    fn request(&mut self) -> SyncResult<StreamingSyncRequest> {
        let storage = &self.shared.storage;
        storage.start_session();
        let states = storage.bucket_states();
        self.bucket_set = states.iter().map(|s| s.bucket.clone()).collect();

        let buckets = states
            .into_iter()
            .map(|s| BucketRequest {
                name: s.bucket,
                after: s.op_id,
            })
            .collect();
        let mut request = StreamingSyncRequest::new(buckets);
        request.parameters = self.shared.config.params.clone();
        request.client_id = Some(storage.client_id()?);
        Ok(request)
    }

    async fn dispatch(&mut self, line: StreamingSyncLine) -> SyncResult<Flow> {
        match line {
            StreamingSyncLine::Checkpoint(checkpoint) => {
                self.on_checkpoint(checkpoint)?;
                Ok(Flow::Continue)
            }
            StreamingSyncLine::CheckpointDiff(diff) => {
                self.on_diff(&diff)?;
                Ok(Flow::Continue)
            }
            StreamingSyncLine::CheckpointComplete(_) => self.apply_target().await,
            StreamingSyncLine::PartialCheckpointComplete(partial) => {
                self.apply_partial(partial.priority).await
            }
            StreamingSyncLine::Data(data) => {
                self.on_data(data)?;
                Ok(Flow::Continue)
            }
            StreamingSyncLine::KeepAlive { token_expires_in } => {
                if token_expires_in <= 0 {
                    tracing::info!("token expired, reconnecting");
                    self.shared.remote.invalidate_credentials();
                    return Ok(Flow::Restart);
                }
                self.uploads.trigger();
                Ok(Flow::Continue)
            }
            StreamingSyncLine::Unknown { fields } => {
                tracing::debug!(
                    kind = "unknown",
                    ?fields,
                    "unrecognized sync line, treating as end of sync"
                );
                if self.target.is_some() && self.target == self.applied {
                    self.shared
                        .status
                        .update(|status| status.last_synced_at = Some(Utc::now()));
                    Ok(Flow::Continue)
                } else if self.target.is_some() && self.validated == self.target {
                    self.apply_target().await
                } else {
                    Ok(Flow::Continue)
                }
            }
        }
    }

    fn on_checkpoint(&mut self, checkpoint: Checkpoint) -> SyncResult<()> {
        let next: BTreeSet<String> = checkpoint.bucket_names().map(str::to_string).collect();
        let removed: Vec<String> = self.bucket_set.difference(&next).cloned().collect();
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "removing buckets missing from checkpoint");
            self.shared.storage.remove_buckets(&removed)?;
        }
        self.bucket_set = next;
        self.set_target(checkpoint);
        Ok(())
    }

    fn on_diff(&mut self, diff: &CheckpointDiff) -> SyncResult<()> {
        let Some(target) = &self.target else {
            return Err(SyncError::protocol("checkpoint_diff without a previous checkpoint"));
        };
        let next = target.apply_diff(diff);
        if !diff.removed_buckets.is_empty() {
            tracing::debug!(count = diff.removed_buckets.len(), "removing buckets from diff");
            self.shared.storage.remove_buckets(&diff.removed_buckets)?;
        }
        self.bucket_set = next.bucket_names().map(str::to_string).collect();
        self.set_target(next);
        Ok(())
    }

    fn set_target(&mut self, checkpoint: Checkpoint) {
        tracing::debug!(op_id = %checkpoint.last_op_id, buckets = checkpoint.buckets.len(), "target checkpoint");
        self.shared.storage.set_target_checkpoint(&checkpoint);
        let progress = SyncProgress::for_checkpoint(
            &checkpoint,
            &self.shared.storage.bucket_operation_progress(),
        );
        self.shared
            .status
            .update(|status| status.data_flow.download_progress = Some(progress));
        self.target = Some(checkpoint);
        self.shared.set_state(SyncState::CheckpointPending);
    }

    fn on_data(&mut self, data: SyncDataBucket) -> SyncResult<()> {
        let entries = data.data.len() as u64;
        let bucket = data.bucket.clone();
        tracing::debug!(bucket = %bucket, entries, "saving data");
        self.shared
            .storage
            .save_sync_data(&SyncDataBatch::from(data))?;
        self.shared.record(|stats| stats.entries_received += entries);
        self.shared.status.update(|status| {
            status.data_flow.downloading = true;
            if let Some(progress) = &mut status.data_flow.download_progress {
                progress.record(&bucket, entries);
            }
        });
        Ok(())
    }

    async fn apply_partial(&mut self, priority: u8) -> SyncResult<Flow> {
        let Some(target) = self.target.clone() else {
            return Err(SyncError::protocol(
                "partial_checkpoint_complete without a checkpoint",
            ));
        };
        tracing::debug!(op_id = %target.last_op_id, priority, "partial checkpoint complete");
        let result = self
            .shared
            .storage
            .sync_local_database(&target, Some(priority))?;

        if !result.checkpoint_valid {
            tracing::warn!(failures = ?result.failures, priority, "checksum validation failed");
            self.shared.record(|stats| stats.checksum_failures += 1);
            sleep(self.cancel, self.shared.config.checksum_retry_delay).await?;
            return Ok(Flow::Restart);
        }
        if !result.ready {
            // Uploads are pending; the full checkpoint will publish this data.
            tracing::debug!(priority, "partial checkpoint valid but not applied");
            return Ok(Flow::Continue);
        }

        let now = Utc::now();
        self.shared
            .record(|stats| stats.partial_checkpoints_applied += 1);
        self.shared.status.update(|status| {
            status.connected = true;
            status.record_partial_sync(priority, now);
        });
        Ok(Flow::Continue)
    }

    async fn apply_target(&mut self) -> SyncResult<Flow> {
        let Some(target) = self.target.clone() else {
            return Err(SyncError::protocol("checkpoint_complete without a checkpoint"));
        };
        let result = self.shared.storage.sync_local_database(&target, None)?;

        if !result.checkpoint_valid {
            tracing::warn!(failures = ?result.failures, "checksum validation failed");
            self.shared.record(|stats| stats.checksum_failures += 1);
            sleep(self.cancel, self.shared.config.checksum_retry_delay).await?;
            return Ok(Flow::Restart);
        }

        self.validated = Some(target.clone());
        if !result.ready {
            tracing::debug!(op_id = %target.last_op_id, "checkpoint valid, waiting for data or uploads");
            self.shared.set_state(SyncState::CheckpointValidated);
            return Ok(Flow::Continue);
        }

        tracing::info!(op_id = %target.last_op_id, "checkpoint applied");
        let now = Utc::now();
        self.applied = Some(target);
        self.shared.record(|stats| {
            stats.checkpoints_applied += 1;
            stats.last_applied_at = Some(now);
        });
        self.shared.status.update(|status| {
            status.last_synced_at = Some(now);
            status.has_synced = Some(true);
            status.data_flow.downloading = false;
            status.data_flow.download_error = None;
            status.data_flow.download_progress = None;
            status.priority_status.clear();
        });
        self.shared.set_state(SyncState::CheckpointApplied);
        Ok(Flow::Continue)
    }
}

/// Runs an upload pass each time `wake` is notified while connected.
pub(crate) async fn upload_loop(shared: Arc<Shared>, wake: Arc<Notify>, cancel: CancelToken) {
    loop {
        tokio::select! {
            _ = wake.notified() => {}
            _ = cancel.cancelled() => break,
        }
        if !shared.status.current().connected {
            tracing::trace!("not connected, skipping upload");
            continue;
        }
        if let Err(err) = upload_pass(&shared, &cancel).await {
            if err.is_cancelled() {
                break;
            }
            tracing::error!(error = %err, "upload pass failed");
        }
    }
    tracing::debug!("upload loop stopped");
}

async fn upload_pass(shared: &Shared, cancel: &CancelToken) -> SyncResult<()> {
    let _lock = shared.locks.acquire(LockType::Crud, cancel).await?;
    let mut checked = None;
    let mut failures = 0u32;
    loop {
        match upload_step(shared, cancel, &mut checked).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                checked = None;
                tracing::warn!(error = %err, "upload failed");
                shared.record(|stats| {
                    stats.upload_failures += 1;
                    stats.last_error = Some(err.to_string());
                });
                shared.status.update(|status| {
                    status.data_flow.uploading = false;
                    status.data_flow.upload_error = Some(err.to_string());
                });
                sleep(cancel, shared.config.retry.delay_for_attempt(failures)).await?;
                failures = failures.saturating_add(1);
                if !shared.status.current().connected {
                    return Ok(());
                }
            }
        }
    }
}

/// Uploads from the head of the queue. Returns false once the queue is
/// drained and the local target was handled.
async fn upload_step(
    shared: &Shared,
    cancel: &CancelToken,
    checked: &mut Option<u64>,
) -> SyncResult<bool> {
    let storage = shared.storage.as_ref();
    if let Some(head) = storage.next_crud_item() {
        if *checked == Some(head.client_id) {
            tracing::warn!(
                client_id = head.client_id,
                "potentially previously uploaded CRUD entries are still present in the upload queue"
            );
            return Err(SyncError::upload(
                "potentially previously uploaded CRUD entries are still present in the upload queue; \
                 uploads must complete their transactions or batches",
            ));
        }
        *checked = Some(head.client_id);
        shared
            .status
            .update(|status| status.data_flow.uploading = true);

        let queue = CrudQueue::new(storage, shared.config.crud_batch_limit);
        cancellable(cancel, shared.connector.upload_data(queue)).await?;
        shared.record(|stats| stats.uploads += 1);
        shared
            .status
            .update(|status| status.data_flow.upload_error = None);
        return Ok(true);
    }

    *checked = None;
    if let Some(fence) = storage.local_target_fence() {
        let client_id = storage.client_id()?;
        let op_id = cancellable(cancel, shared.remote.write_checkpoint(&client_id)).await?;
        let updated = storage.update_local_target(fence, op_id)?;
        tracing::debug!(op_id = %op_id, updated, "write checkpoint");
    }
    shared.status.update(|status| {
        status.data_flow.uploading = false;
        status.data_flow.upload_error = None;
    });
    Ok(false)
}
