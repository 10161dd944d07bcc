//! Sync stream transports.
//!
//! A [`Transport`] opens one sync stream and hands back a [`LineStream`].
//! Two implementations exist, selected by [`TransportKind`]:
//! [`HttpStreamTransport`] reads newline-delimited JSON from a chunked POST,
//! [`SocketTransport`] reads CBOR frames under credit-based flow control.
//!
//! [`TransportKind`]: crate::TransportKind

mod http;
mod socket;

pub use http::{HttpStreamTransport, LineSplitter};
pub use socket::{CreditWindow, FrameSocket, SocketConnector, SocketTransport};

use crate::cancel::CancelToken;
use crate::error::SyncResult;
use async_trait::async_trait;
use bucketsync_protocol::{StreamingSyncLine, StreamingSyncRequest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Opens sync streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a stream for `request`. The stream stops when `cancel` fires.
    async fn open_stream(
        &self,
        request: &StreamingSyncRequest,
        cancel: &CancelToken,
    ) -> SyncResult<LineStream>;
}

/// Sending half of a [`LineStream`].
pub type LineSender = mpsc::Sender<SyncResult<StreamingSyncLine>>;

/// Lines received on an open sync stream, in order.
///
/// `None` from [`LineStream::next`] means the stream ended. Dropping the
/// stream stops the task feeding it.
#[derive(Debug)]
pub struct LineStream {
    rx: mpsc::Receiver<SyncResult<StreamingSyncLine>>,
    task: Option<JoinHandle<()>>,
}

impl LineStream {
    /// Creates a bounded channel and the stream reading from it.
    pub fn channel(capacity: usize) -> (LineSender, LineStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, LineStream { rx, task: None })
    }

    /// Ties the producing task to this stream's lifetime.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Receives the next line.
    pub async fn next(&mut self) -> Option<SyncResult<StreamingSyncLine>> {
        self.rx.recv().await
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
