//! # bucketsync engine
//!
//! Streaming sync state machine and upload loop for bucketsync clients.
//!
//! This crate provides:
//! - [`SyncEngine`], which keeps one sync stream open per local identity
//!   and applies checkpoints to a [`BucketStorageAdapter`]
//! - the upload loop that drains the CRUD queue through a
//!   [`BackendConnector`] and fences the `$local` target with a write
//!   checkpoint
//! - two transports: NDJSON over a chunked HTTP POST and CBOR frames over a
//!   socket with credit-based flow control
//! - named locks ([`InProcessLocks`], [`FileLocks`]) and hierarchical
//!   cancellation ([`CancelToken`])
//! - [`StatusObserver`] publishing [`SyncStatus`] to listeners
//!
//! ## Iteration
//!
//! ```text
//! disconnected → connecting → streaming
//!     checkpoint / checkpoint_diff   set target, drop missing buckets
//!     data                           save oplog entries, count progress
//!     partial_checkpoint_complete    apply buckets up to a priority
//!     checkpoint_complete            validate and apply the target
//!     token_expires_in = 0           reconnect with fresh credentials
//!   stream end or error → retry after delay
//! ```
//!
//! ## Key Invariants
//!
//! - At most one streaming iteration per SYNC lock, one upload pass per CRUD lock
//! - A checksum failure restarts the iteration without backoff
//! - Cancellation never triggers a retry
//! - The `$local` target only moves when no local write raced the write checkpoint
//!
//! [`BucketStorageAdapter`]: bucketsync_store::BucketStorageAdapter

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod config;
mod connector;
mod engine;
mod error;
mod http;
mod lock;
pub mod mock;
mod progress;
mod remote;
mod state;
mod status;
mod streaming;
mod throttle;
pub mod transport;

pub use cancel::CancelToken;
pub use config::{FlowControlConfig, RetryConfig, SyncConfig, TransportKind};
pub use connector::{BackendConnector, Credentials, CrudQueue};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use http::{ByteStream, HttpClient, HttpRequest, HttpResponse, Method};
pub use lock::{FileLocks, InProcessLocks, LockGuard, LockManager, LockType};
pub use progress::{BucketProgress, ProgressWithOperations, SyncProgress};
pub use remote::Remote;
pub use state::{SyncState, SyncStats};
pub use status::{DataFlowStatus, ListenerHandle, PriorityStatus, StatusObserver, SyncStatus};
pub use throttle::{spawn_throttle, ThrottleHandle};
pub use transport::{LineStream, Transport};
