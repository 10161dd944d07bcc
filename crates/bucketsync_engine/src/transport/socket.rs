//! Credit-based socket transport.
//!
//! The client grants the server a window of payload credit and tops it up
//! as lines are consumed, so a fast server can never buffer more than a
//! bounded number of unprocessed lines on the client.

use super::{LineSender, LineStream, Transport};
use crate::cancel::CancelToken;
use crate::config::{FlowControlConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::remote::Remote;
use async_trait::async_trait;
use bucketsync_protocol::{Frame, StreamingSyncLine, StreamingSyncRequest};
use std::sync::Arc;
use std::time::Duration;

/// A connected, message-oriented socket carrying encoded frames.
#[async_trait]
pub trait FrameSocket: Send {
    /// Sends one encoded frame.
    async fn send(&mut self, frame: Vec<u8>) -> SyncResult<()>;

    /// Receives one encoded frame. `None` means the peer closed.
    async fn recv(&mut self) -> SyncResult<Option<Vec<u8>>>;
}

/// Opens sockets. Supplied by the host (websocket, TCP, in-memory).
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Connects to the service at `endpoint`.
    async fn connect(&self, endpoint: &str) -> SyncResult<Box<dyn FrameSocket>>;
}

/// Tracks payload credit granted to the server.
#[derive(Debug, Clone)]
pub struct CreditWindow {
    config: FlowControlConfig,
    outstanding: u32,
}

impl CreditWindow {
    /// Creates a window with no credit granted yet.
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            outstanding: 0,
        }
    }

    /// Grants the full window and returns it.
    pub fn initial(&mut self) -> u32 {
        self.outstanding = self.config.window;
        self.config.window
    }

    /// Records one received payload.
    pub fn on_payload(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Credit the server may still use.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Returns the credit to request, if any, given `buffered` unprocessed
    /// lines.
    pub fn replenish(&mut self, buffered: usize) -> Option<u32> {
        if self.outstanding >= self.config.low_water.max(1) || buffered >= self.config.high_water {
            return None;
        }
        let n = self.config.window.saturating_sub(self.outstanding);
        if n == 0 {
            return None;
        }
        self.outstanding = self.config.window;
        Some(n)
    }
}

/// Streams sync lines over a [`FrameSocket`].
pub struct SocketTransport {
    remote: Arc<Remote>,
    connector: Arc<dyn SocketConnector>,
    flow: FlowControlConfig,
    stale_timeout: Duration,
    keepalive_interval: Duration,
    token_lifetime: Duration,
}

impl SocketTransport {
    /// Creates a transport using the socket settings from `config`.
    pub fn new(remote: Arc<Remote>, connector: Arc<dyn SocketConnector>, config: &SyncConfig) -> Self {
        Self {
            remote,
            connector,
            flow: config.flow,
            stale_timeout: config.stale_timeout,
            keepalive_interval: config.keepalive_interval,
            token_lifetime: config.token_lifetime,
        }
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("flow", &self.flow)
            .field("stale_timeout", &self.stale_timeout)
            .finish_non_exhaustive()
    }
}

async fn send_frame(socket: &mut dyn FrameSocket, frame: &Frame) -> SyncResult<()> {
    socket.send(frame.encode()?).await
}

#[async_trait]
impl Transport for SocketTransport {
    async fn open_stream(
        &self,
        request: &StreamingSyncRequest,
        cancel: &CancelToken,
    ) -> SyncResult<LineStream> {
        let credentials = self.remote.credentials().await?;
        let mut socket = tokio::select! {
            socket = self.connector.connect(&credentials.endpoint) => socket?,
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        send_frame(
            socket.as_mut(),
            &Frame::Setup {
                token: credentials.token,
                user_agent: self.remote.user_agent().to_string(),
                keepalive_ms: duration_ms(self.keepalive_interval),
                lifetime_ms: duration_ms(self.token_lifetime),
            },
        )
        .await?;

        let mut window = CreditWindow::new(self.flow);
        let payload = serde_json::to_vec(request).map_err(|e| SyncError::Codec(e.to_string()))?;
        send_frame(
            socket.as_mut(),
            &Frame::RequestStream {
                initial_credit: window.initial(),
                payload,
            },
        )
        .await?;

        let (tx, stream) = LineStream::channel(self.flow.high_water);
        let reader = SocketReader {
            socket,
            tx,
            window,
            stale_timeout: self.stale_timeout,
            remote: Arc::clone(&self.remote),
        };
        let task = tokio::spawn(reader.run(cancel.clone()));
        Ok(stream.with_task(task))
    }
}

struct SocketReader {
    socket: Box<dyn FrameSocket>,
    tx: LineSender,
    window: CreditWindow,
    stale_timeout: Duration,
    remote: Arc<Remote>,
}

enum Step {
    Continue,
    Done,
}

impl SocketReader {
    async fn run(mut self, cancel: CancelToken) {
        let result = tokio::select! {
            result = self.pump() => Some(result),
            _ = cancel.cancelled() => None,
        };
        match result {
            Some(Ok(())) => tracing::debug!("socket stream ended"),
            Some(Err(err)) => {
                tracing::debug!(error = %err, "socket stream failed");
                let _ = self.tx.send(Err(err)).await;
            }
            None => {
                let _ = send_frame(self.socket.as_mut(), &Frame::Cancel).await;
                tracing::debug!("socket stream cancelled");
            }
        }
    }

    fn buffered(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    async fn pump(&mut self) -> SyncResult<()> {
        loop {
            if let Some(n) = self.window.replenish(self.buffered()) {
                tracing::trace!(n, "granting credit");
                send_frame(self.socket.as_mut(), &Frame::RequestN { n }).await?;
            } else if self.window.outstanding() == 0 {
                // Paused until the consumer drains a line.
                let permit = self
                    .tx
                    .reserve()
                    .await
                    .map_err(|_| SyncError::Cancelled)?;
                drop(permit);
                continue;
            }

            let frame = match tokio::time::timeout(self.stale_timeout, self.socket.recv()).await {
                Ok(frame) => frame?,
                Err(_) => return Err(SyncError::Timeout),
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            match self.handle(Frame::decode(&frame)?).await? {
                Step::Continue => {}
                Step::Done => return Ok(()),
            }
        }
    }

    async fn handle(&mut self, frame: Frame) -> SyncResult<Step> {
        match frame {
            Frame::Payload { data, complete } => {
                self.window.on_payload();
                let line = StreamingSyncLine::from_cbor(&data)?;
                if self.tx.send(Ok(line)).await.is_err() {
                    return Ok(Step::Done);
                }
                Ok(if complete { Step::Done } else { Step::Continue })
            }
            Frame::KeepAlive => Ok(Step::Continue),
            Frame::Complete => Ok(Step::Done),
            Frame::Error { code, message } => {
                if code == 401 {
                    self.remote.invalidate_credentials();
                    return Err(SyncError::AuthenticationFailed(message));
                }
                Err(SyncError::transport_retryable(format!(
                    "server error {code}: {message}"
                )))
            }
            other => Err(SyncError::protocol(format!(
                "unexpected frame from server: {other:?}"
            ))),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
