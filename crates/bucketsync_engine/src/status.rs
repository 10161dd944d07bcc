//! Sync status and its observers.

use crate::progress::SyncProgress;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Upload and download activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFlowStatus {
    /// An upload pass is forwarding local writes.
    pub uploading: bool,
    /// Data for a checkpoint is arriving.
    pub downloading: bool,
    /// Last upload failure, cleared by the next successful pass.
    pub upload_error: Option<String>,
    /// Last iteration failure, cleared on reconnect.
    pub download_error: Option<String>,
    /// Progress towards the target checkpoint while downloading.
    pub download_progress: Option<SyncProgress>,
}

/// Sync state of the buckets up to one priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityStatus {
    /// Buckets at this priority or lower are covered.
    pub priority: u8,
    /// When they were last applied.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether they were ever applied.
    pub has_synced: Option<bool>,
}

/// Everything the embedding application can observe about sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// A sync stream is open.
    pub connected: bool,
    /// A connection attempt is in progress.
    pub connecting: bool,
    /// When a checkpoint was last applied or confirmed.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether any checkpoint was ever applied. `None` until known.
    pub has_synced: Option<bool>,
    /// Upload and download activity.
    pub data_flow: DataFlowStatus,
    /// Partial syncs since the last full one, ordered by priority.
    pub priority_status: Vec<PriorityStatus>,
}

impl SyncStatus {
    /// Sync state of the buckets at `priority`.
    ///
    /// A partial sync at a priority covers every more urgent one. Without a
    /// covering partial sync, the state of the last full sync applies.
    #[must_use]
    pub fn status_for_priority(&self, priority: u8) -> PriorityStatus {
        self.priority_status
            .iter()
            .find(|entry| entry.priority >= priority)
            .cloned()
            .unwrap_or(PriorityStatus {
                priority,
                last_synced_at: self.last_synced_at,
                has_synced: self.has_synced,
            })
    }

    /// Records a partial sync at `priority`, replacing the entries it covers.
    pub(crate) fn record_partial_sync(&mut self, priority: u8, at: DateTime<Utc>) {
        self.priority_status.retain(|entry| entry.priority > priority);
        self.priority_status.push(PriorityStatus {
            priority,
            last_synced_at: Some(at),
            has_synced: Some(true),
        });
        self.priority_status.sort_by_key(|entry| entry.priority);
    }
}

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;
type Registry = Mutex<BTreeMap<u64, Listener>>;

/// Owns the current [`SyncStatus`] and notifies listeners when it changes.
pub struct StatusObserver {
    tx: watch::Sender<SyncStatus>,
    listeners: Arc<Registry>,
    next_id: AtomicU64,
}

impl StatusObserver {
    /// Creates an observer holding `initial`.
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns a copy of the current status.
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Applies `f` to the status. Listeners run only if something changed.
    ///
    /// Returns whether the status changed.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) -> bool {
        let mut next = self.current();
        f(&mut next);
        let changed = self.tx.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            *status = next.clone();
            true
        });
        if changed {
            let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
            for listener in listeners {
                listener(&next);
            }
        }
        changed
    }

    /// Registers `listener`; it stays registered while the handle lives.
    pub fn register(&self, listener: impl Fn(&SyncStatus) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Returns a receiver that sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Waits until the status satisfies `predicate` and returns it.
    pub async fn wait_for(&self, predicate: impl FnMut(&SyncStatus) -> bool) -> SyncStatus {
        let mut rx = self.subscribe();
        let matched = rx.wait_for(predicate).await.map(|status| status.clone());
        // The sender lives as long as `self`.
        matched.unwrap_or_else(|_| self.current())
    }

    /// Waits until a checkpoint has been applied at least once.
    pub async fn wait_for_first_sync(&self) {
        self.wait_for(|status| status.has_synced == Some(true)).await;
    }
}

impl std::fmt::Debug for StatusObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusObserver")
            .field("status", &*self.tx.borrow())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Keeps a status listener registered. Dropping it unregisters.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<Registry>,
}

impl ListenerHandle {
    /// Removes the listener now.
    pub fn unregister(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(&self.id);
        }
    }
}
