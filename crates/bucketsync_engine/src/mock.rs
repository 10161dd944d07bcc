//! Scripted stand-ins for the network and the embedding application.
//!
//! These drive the engine in tests without a sync service: a
//! [`MockTransport`] replays canned sync lines, a [`MockHttpClient`] answers
//! requests by path, a [`MockConnector`] hands out fixed credentials and
//! acknowledges uploads, and a [`MockSocketConnector`] exposes the server
//! side of an in-memory socket.

use crate::cancel::CancelToken;
use crate::connector::{BackendConnector, Credentials, CrudQueue};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::transport::{FrameSocket, LineStream, SocketConnector, Transport};
use async_trait::async_trait;
use bucketsync_protocol::{CrudEntry, Frame, OpId, StreamingSyncLine, StreamingSyncRequest};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};

enum Script {
    Lines {
        lines: Vec<SyncResult<StreamingSyncLine>>,
        hold_open: bool,
    },
    Fail(SyncError),
}

/// A transport that replays scripted sessions, one per `open_stream`.
///
/// Once the script runs out, streams stay open and silent until cancelled.
pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamingSyncRequest>>,
    opened: watch::Sender<usize>,
}

impl MockTransport {
    /// Creates a transport with no scripted sessions.
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            opened,
        }
    }

    /// Queues a session that delivers `lines` and then stays open.
    pub fn push_session(&self, lines: Vec<StreamingSyncLine>) {
        self.scripts.lock().push_back(Script::Lines {
            lines: lines.into_iter().map(Ok).collect(),
            hold_open: true,
        });
    }

    /// Queues a session that delivers `lines` and then ends.
    pub fn push_closing_session(&self, lines: Vec<StreamingSyncLine>) {
        self.scripts.lock().push_back(Script::Lines {
            lines: lines.into_iter().map(Ok).collect(),
            hold_open: false,
        });
    }

    /// Queues a session whose stream yields `error` after `lines`.
    pub fn push_failing_session(&self, lines: Vec<StreamingSyncLine>, error: SyncError) {
        let mut lines: Vec<_> = lines.into_iter().map(Ok).collect();
        lines.push(Err(error));
        self.scripts.lock().push_back(Script::Lines {
            lines,
            hold_open: false,
        });
    }

    /// Queues a failure to open a stream.
    pub fn push_open_failure(&self, error: SyncError) {
        self.scripts.lock().push_back(Script::Fail(error));
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<StreamingSyncRequest> {
        self.requests.lock().clone()
    }

    /// Waits until at least `count` streams were requested.
    pub async fn wait_for_requests(&self, count: usize) {
        let mut rx = self.opened.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_stream(
        &self,
        request: &StreamingSyncRequest,
        cancel: &CancelToken,
    ) -> SyncResult<LineStream> {
        self.requests.lock().push(request.clone());
        self.opened.send_modify(|opened| *opened += 1);

        let script = self.scripts.lock().pop_front();
        let (lines, hold_open) = match script {
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::Lines { lines, hold_open }) => (lines, hold_open),
            None => (Vec::new(), true),
        };

        let (tx, stream) = LineStream::channel(lines.len() + 1);
        let cancel = cancel.clone();
        let task = tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            if hold_open {
                cancel.cancelled().await;
            }
        });
        Ok(stream.with_task(task))
    }
}

struct Route {
    method: Method,
    path: String,
    responses: VecDeque<(u16, Vec<Bytes>)>,
}

/// An HTTP client answering from canned responses keyed by method and path.
///
/// Each route replays its responses in order and repeats the last one.
/// Unknown routes answer 404.
#[derive(Default)]
pub struct MockHttpClient {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    /// Creates a client with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a response with a complete body.
    pub fn respond(&self, method: Method, path: &str, status: u16, body: &str) {
        self.respond_chunks(method, path, status, vec![body]);
    }

    /// Adds a response whose body arrives in `chunks`.
    pub fn respond_chunks(&self, method: Method, path: &str, status: u16, chunks: Vec<&str>) {
        let chunks = chunks
            .into_iter()
            .map(|c| Bytes::copy_from_slice(c.as_bytes()))
            .collect();
        let mut routes = self.routes.lock();
        match routes.iter_mut().find(|r| r.method == method && r.path == path) {
            Some(route) => route.responses.push_back((status, chunks)),
            None => routes.push(Route {
                method,
                path: path.to_string(),
                responses: VecDeque::from([(status, chunks)]),
            }),
        }
    }

    /// Returns every request sent so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Returns requests sent to `path`.
    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| url_path(&r.url) == path)
            .cloned()
            .collect()
    }
}

fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = rest.find('/').map_or("", |i| &rest[i..]);
    path.split('?').next().unwrap_or(path)
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let path = url_path(&request.url).to_string();
        let method = request.method;
        self.requests.lock().push(request);

        let response = {
            let mut routes = self.routes.lock();
            routes
                .iter_mut()
                .find(|r| r.method == method && r.path == path)
                .and_then(|route| {
                    if route.responses.len() > 1 {
                        route.responses.pop_front()
                    } else {
                        route.responses.front().cloned()
                    }
                })
        };
        let (status, chunks) = response.unwrap_or((404, vec![Bytes::from_static(b"no route")]));
        let body = stream::iter(chunks.into_iter().map(Ok)).boxed();
        Ok(HttpResponse::new(status, body))
    }
}

/// A connector with fixed credentials that uploads by transaction.
pub struct MockConnector {
    credentials: Mutex<Option<Credentials>>,
    fetches: AtomicUsize,
    upload_calls: AtomicUsize,
    failures: AtomicUsize,
    complete_uploads: AtomicBool,
    write_checkpoint: Mutex<Option<OpId>>,
    uploaded: Mutex<Vec<CrudEntry>>,
}

impl MockConnector {
    /// Creates a connector returning `credentials`.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Mutex::new(Some(credentials)),
            fetches: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            complete_uploads: AtomicBool::new(true),
            write_checkpoint: Mutex::new(None),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    /// Creates a connector for a signed-out user.
    pub fn signed_out() -> Self {
        let connector = Self::new(Credentials::new("", ""));
        *connector.credentials.lock() = None;
        connector
    }

    /// Replaces the credentials.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.lock() = credentials;
    }

    /// Number of `fetch_credentials` calls.
    pub fn credential_fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of `upload_data` calls.
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `count` uploads fail.
    pub fn fail_next_uploads(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// When false, uploads read the queue but never complete it.
    pub fn set_complete_uploads(&self, complete: bool) {
        self.complete_uploads.store(complete, Ordering::SeqCst);
    }

    /// Write checkpoint passed to `complete`.
    pub fn set_write_checkpoint(&self, op_id: Option<OpId>) {
        *self.write_checkpoint.lock() = op_id;
    }

    /// Entries uploaded so far, in upload order.
    pub fn uploaded(&self) -> Vec<CrudEntry> {
        self.uploaded.lock().clone()
    }
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials.lock().clone())
    }

    async fn upload_data(&self, queue: CrudQueue<'_>) -> SyncResult<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::upload("rejected by backend"));
        }

        while let Some(transaction) = queue.next_transaction() {
            self.uploaded.lock().extend(transaction.crud.iter().cloned());
            if !self.complete_uploads.load(Ordering::SeqCst) {
                return Ok(());
            }
            let write_checkpoint = *self.write_checkpoint.lock();
            transaction.complete(write_checkpoint)?;
        }
        Ok(())
    }
}

/// Server side of an in-memory socket.
#[derive(Debug)]
pub struct SocketPeer {
    /// Endpoint the client connected to.
    pub endpoint: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl SocketPeer {
    /// Receives the next frame from the client. `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        let bytes = self.rx.recv().await?;
        Frame::decode(&bytes).ok()
    }

    /// Sends a frame to the client. Returns false once it hung up.
    pub fn send(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(bytes) => self.tx.send(bytes).is_ok(),
            Err(_) => false,
        }
    }

    /// Sends `line` as a payload frame.
    pub fn send_line(&self, line: &StreamingSyncLine, complete: bool) -> bool {
        match line.to_cbor() {
            Ok(data) => self.send(&Frame::Payload { data, complete }),
            Err(_) => false,
        }
    }
}

struct MemorySocket {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSocket for MemorySocket {
    async fn send(&mut self, frame: Vec<u8>) -> SyncResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| SyncError::transport_retryable("socket closed"))
    }

    async fn recv(&mut self) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

/// Opens in-memory sockets and hands their server side to the test.
pub struct MockSocketConnector {
    peers: mpsc::UnboundedSender<SocketPeer>,
}

impl MockSocketConnector {
    /// Creates a connector and the receiver of server-side peers.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<SocketPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl SocketConnector for MockSocketConnector {
    async fn connect(&self, endpoint: &str) -> SyncResult<Box<dyn FrameSocket>> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let peer = SocketPeer {
            endpoint: endpoint.to_string(),
            rx: server_rx,
            tx: server_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| SyncError::transport_retryable("connection refused"))?;
        Ok(Box::new(MemorySocket {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_paths() {
        assert_eq!(url_path("https://h.example/a/b?x=1"), "/a/b");
        assert_eq!(url_path("http://h.example"), "");
        assert_eq!(url_path("/local"), "/local");
    }

    #[tokio::test]
    async fn routes_replay_then_repeat() {
        let client = MockHttpClient::new();
        client.respond(Method::Get, "/x", 500, "first");
        client.respond(Method::Get, "/x", 200, "second");

        let status = |r: SyncResult<HttpResponse>| r.unwrap().status;
        let get = || HttpRequest::new(Method::Get, "https://h.example/x");
        assert_eq!(status(client.send(get()).await), 500);
        assert_eq!(status(client.send(get()).await), 200);
        assert_eq!(status(client.send(get()).await), 200);
        assert_eq!(
            status(client.send(HttpRequest::new(Method::Post, "https://h.example/x")).await),
            404
        );
        assert_eq!(client.requests_to("/x").len(), 4);
    }
}
