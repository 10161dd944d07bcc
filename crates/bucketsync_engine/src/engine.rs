//! The sync engine: connect, disconnect and observe.

use crate::cancel::CancelToken;
use crate::config::{SyncConfig, TransportKind};
use crate::connector::BackendConnector;
use crate::error::{SyncError, SyncResult};
use crate::http::HttpClient;
use crate::lock::{InProcessLocks, LockManager};
use crate::remote::Remote;
use crate::state::{SyncState, SyncStats};
use crate::status::{ListenerHandle, StatusObserver, SyncStatus};
use crate::streaming::{streaming_loop, upload_loop, Shared};
use crate::throttle::{spawn_throttle, ThrottleHandle};
use crate::transport::{HttpStreamTransport, SocketConnector, SocketTransport, Transport};
use bucketsync_store::{BucketStorageAdapter, UploadQueueStats};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

struct Session {
    cancel: CancelToken,
    uploads: ThrottleHandle,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps local storage converging toward the server's latest checkpoint and
/// uploads local writes.
///
/// While connected the engine runs a streaming loop under the SYNC lock, an
/// upload loop under the CRUD lock, a throttle coalescing upload triggers and
/// a task forwarding CRUD queue changes to the throttle. Everything observable
/// goes through [`SyncStatus`].
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use bucketsync_engine::{SyncEngine, SyncConfig, BackendConnector, HttpClient};
/// # use bucketsync_store::LocalStore;
/// # async fn run(connector: Arc<dyn BackendConnector>, http: Arc<dyn HttpClient>) -> bucketsync_engine::SyncResult<()> {
/// let store = Arc::new(LocalStore::open_in_memory()?);
/// let engine = SyncEngine::builder(store, connector, http)
///     .with_config(SyncConfig::default())
///     .build()?;
/// engine.connect().await;
/// engine.wait_for_first_sync().await;
/// engine.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    shared: Arc<Shared>,
    transition: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
}

impl SyncEngine {
    /// Starts building an engine over `storage`.
    pub fn builder(
        storage: Arc<dyn BucketStorageAdapter>,
        connector: Arc<dyn BackendConnector>,
        http: Arc<dyn HttpClient>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            storage,
            connector,
            http,
            config: SyncConfig::default(),
            locks: None,
            socket: None,
            transport: None,
        }
    }

    /// Starts syncing, replacing any running session.
    pub async fn connect(&self) {
        let _transition = self.transition.lock().await;
        self.stop_session().await;

        let shared = &self.shared;
        let cancel = CancelToken::new();
        shared.status.update(|status| status.connecting = true);
        shared.set_state(SyncState::Connecting);

        let wake = Arc::new(Notify::new());
        let notify = Arc::clone(&wake);
        let (uploads, throttle) = spawn_throttle(
            shared.config.crud_upload_throttle,
            cancel.clone(),
            move || notify.notify_one(),
        );
        let tasks = vec![
            throttle,
            tokio::spawn(upload_loop(Arc::clone(shared), wake, cancel.clone())),
            tokio::spawn(streaming_loop(
                Arc::clone(shared),
                uploads.clone(),
                cancel.clone(),
            )),
            tokio::spawn(forward_crud_changes(
                shared.storage.subscribe_crud(),
                uploads.clone(),
                cancel.clone(),
            )),
        ];
        uploads.trigger();
        *self.session.lock() = Some(Session {
            cancel,
            uploads,
            tasks,
        });
        tracing::info!("sync connecting");
    }

    /// Stops syncing. Safe to call at any time.
    pub async fn disconnect(&self) {
        let _transition = self.transition.lock().await;
        self.stop_session().await;
    }

    /// Disconnects and deletes all synced and local data. The client id is
    /// kept.
    pub async fn disconnect_and_clear(&self) -> SyncResult<()> {
        let _transition = self.transition.lock().await;
        self.stop_session().await;
        self.shared.storage.clear_all()?;
        self.shared.status.update(|status| {
            status.last_synced_at = None;
            status.has_synced = Some(false);
        });
        tracing::info!("local data cleared");
        Ok(())
    }

    async fn stop_session(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        session.cancel.cancel();
        for task in session.tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "sync task panicked");
                }
            }
        }
        self.shared.status.update(|status| {
            status.connected = false;
            status.connecting = false;
            status.data_flow.uploading = false;
            status.data_flow.downloading = false;
            status.data_flow.download_progress = None;
        });
        self.shared.set_state(SyncState::Disconnected);
        tracing::info!("sync disconnected");
    }

    /// Requests an upload pass. Ignored while disconnected.
    pub fn trigger_upload(&self) {
        if let Some(session) = self.session.lock().as_ref() {
            session.uploads.trigger();
        }
    }

    /// Returns true while a session is running.
    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.shared.status.current()
    }

    /// Returns the status observer.
    pub fn observer(&self) -> &Arc<StatusObserver> {
        &self.shared.status
    }

    /// Calls `listener` on every status change until the handle is dropped.
    pub fn register_listener(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.status.register(listener)
    }

    /// Waits until a checkpoint has been applied at least once.
    pub async fn wait_for_first_sync(&self) {
        self.shared.status.wait_for_first_sync().await;
    }

    /// Returns where the streaming loop is.
    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// Returns a copy of the counters.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Returns the size of the upload queue.
    pub fn upload_queue_stats(&self, include_size: bool) -> SyncResult<UploadQueueStats> {
        Ok(self.shared.storage.upload_queue_stats(include_size)?)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn forward_crud_changes(
    mut changes: watch::Receiver<u64>,
    uploads: ThrottleHandle,
    cancel: CancelToken,
) {
    loop {
        tokio::select! {
            changed = changes.changed() => if changed.is_err() { return },
            _ = cancel.cancelled() => return,
        }
        tracing::trace!(seq = *changes.borrow(), "crud queue changed");
        uploads.trigger();
    }
}

/// Builds a [`SyncEngine`].
pub struct SyncEngineBuilder {
    storage: Arc<dyn BucketStorageAdapter>,
    connector: Arc<dyn BackendConnector>,
    http: Arc<dyn HttpClient>,
    config: SyncConfig,
    locks: Option<Arc<dyn LockManager>>,
    socket: Option<Arc<dyn SocketConnector>>,
    transport: Option<Arc<dyn Transport>>,
}

impl SyncEngineBuilder {
    /// Sets the configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the lock manager. Defaults to [`InProcessLocks`].
    pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Sets the socket connector used by [`TransportKind::Socket`].
    pub fn with_socket_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.socket = Some(connector);
        self
    }

    /// Uses `transport` instead of the one selected by the configuration.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the engine. It starts disconnected.
    ///
    /// # Errors
    ///
    /// Fails when the socket transport is selected without a socket
    /// connector.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let config = self.config;
        let remote = Arc::new(Remote::new(
            Arc::clone(&self.connector),
            self.http,
            config.credential_refresh_margin,
            config.user_agent.clone(),
        ));

        let transport: Arc<dyn Transport> = match (self.transport, config.transport) {
            (Some(transport), _) => transport,
            (None, TransportKind::Http) => Arc::new(HttpStreamTransport::new(
                Arc::clone(&remote),
                config.flow.high_water,
            )),
            (None, TransportKind::Socket) => {
                let socket = self.socket.ok_or_else(|| {
                    SyncError::transport_fatal("socket transport needs a socket connector")
                })?;
                Arc::new(SocketTransport::new(Arc::clone(&remote), socket, &config))
            }
        };

        let status = StatusObserver::new(SyncStatus {
            has_synced: Some(self.storage.has_completed_sync()),
            ..SyncStatus::default()
        });

        let shared = Shared {
            storage: self.storage,
            connector: self.connector,
            remote,
            transport,
            locks: self
                .locks
                .unwrap_or_else(|| Arc::new(InProcessLocks::new())),
            config,
            status: Arc::new(status),
            state: RwLock::new(SyncState::Disconnected),
            stats: RwLock::new(SyncStats::default()),
        };
        Ok(SyncEngine {
            shared: Arc::new(shared),
            transition: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
        })
    }
}
