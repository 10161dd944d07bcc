//! Newline-delimited JSON over a chunked HTTP POST.

use super::{LineSender, LineStream, Transport};
use crate::cancel::CancelToken;
use crate::error::SyncResult;
use crate::http::ByteStream;
use crate::remote::Remote;
use async_trait::async_trait;
use bucketsync_protocol::{StreamingSyncLine, StreamingSyncRequest};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;

const STREAM_PATH: &str = "/sync/stream";

/// Splits a byte stream into lines, keeping partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: BytesMut,
}

impl LineSplitter {
    /// Creates an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed.
    ///
    /// Blank lines are skipped and a trailing `\r` is trimmed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1).freeze();
            if let Some(line) = trim_line(line) {
                lines.push(line);
            }
        }
        lines
    }

    /// Returns the unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        trim_line(self.buffer.split().freeze())
    }
}

fn trim_line(line: Bytes) -> Option<Bytes> {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    let start = line[..end]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(end);
    (start < end).then(|| line.slice(start..end))
}

/// Streams sync lines from `POST <endpoint>/sync/stream`.
#[derive(Debug)]
pub struct HttpStreamTransport {
    remote: Arc<Remote>,
    buffer: usize,
}

impl HttpStreamTransport {
    /// Creates a transport that buffers up to `buffer` parsed lines.
    pub fn new(remote: Arc<Remote>, buffer: usize) -> Self {
        Self { remote, buffer }
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
    async fn open_stream(
        &self,
        request: &StreamingSyncRequest,
        cancel: &CancelToken,
    ) -> SyncResult<LineStream> {
        let body = tokio::select! {
            body = self.remote.post_stream(STREAM_PATH, request) => body?,
            _ = cancel.cancelled() => return Err(crate::error::SyncError::Cancelled),
        };
        let (tx, stream) = LineStream::channel(self.buffer);
        let task = tokio::spawn(pump_lines(body, tx, cancel.clone()));
        Ok(stream.with_task(task))
    }
}

async fn pump_lines(mut body: ByteStream, tx: LineSender, cancel: CancelToken) {
    let mut splitter = LineSplitter::new();
    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = cancel.cancelled() => return,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for line in splitter.push(&bytes) {
                    if tx.send(parse_line(&line)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
            None => {
                if let Some(line) = splitter.finish() {
                    let _ = tx.send(parse_line(&line)).await;
                }
                tracing::debug!("sync stream body ended");
                return;
            }
        }
    }
}

fn parse_line(line: &[u8]) -> SyncResult<StreamingSyncLine> {
    let parsed = StreamingSyncLine::from_json(line)?;
    tracing::trace!(kind = parsed.kind(), "received line");
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Credentials;
    use crate::error::SyncError;
    use crate::http::Method;
    use crate::mock::{MockConnector, MockHttpClient};
    use std::time::Duration;

    fn lines_of(splitter: &mut LineSplitter, chunk: &str) -> Vec<String> {
        splitter
            .push(chunk.as_bytes())
            .into_iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn partial_lines_span_chunks() {
        let mut splitter = LineSplitter::new();
        assert!(lines_of(&mut splitter, "{\"a\":").is_empty());
        assert_eq!(lines_of(&mut splitter, "1}\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(lines_of(&mut splitter, ":2}\r\n\n"), vec!["{\"b\":2}"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn trailing_line_is_flushed() {
        let mut splitter = LineSplitter::new();
        assert_eq!(lines_of(&mut splitter, "{}\n{\"c\":3}"), vec!["{}"]);
        assert_eq!(splitter.finish().unwrap(), Bytes::from_static(b"{\"c\":3}"));
        assert_eq!(splitter.finish(), None);
    }

    fn transport(client: Arc<MockHttpClient>) -> HttpStreamTransport {
        let connector = Arc::new(MockConnector::new(Credentials::new(
            "https://sync.example.com",
            "t",
        )));
        let remote = Arc::new(Remote::new(
            connector,
            client,
            Duration::from_secs(30),
            "test",
        ));
        HttpStreamTransport::new(remote, 8)
    }

    #[tokio::test]
    async fn chunked_body_becomes_lines() {
        let client = Arc::new(MockHttpClient::new());
        client.respond_chunks(
            Method::Post,
            "/sync/stream",
            200,
            vec![
                "{\"checkpoint\":{\"last_op_id\":\"1\",\"buckets\":[]}}\n{\"token_ex",
                "pires_in\":30}\n{\"unexpected\":true}\n",
                "{\"checkpoint_complete\":{\"last_op_id\":\"1\"}}",
            ],
        );
        let transport = transport(Arc::clone(&client));
        let cancel = CancelToken::new();
        let request = StreamingSyncRequest::new(Vec::new());
        let mut stream = transport.open_stream(&request, &cancel).await.unwrap();

        let mut kinds = Vec::new();
        while let Some(line) = stream.next().await {
            kinds.push(line.unwrap().kind());
        }
        assert_eq!(
            kinds,
            vec!["checkpoint", "token_expires_in", "unknown", "checkpoint_complete"]
        );

        let sent = client.requests();
        let body: serde_json::Value = serde_json::from_slice(sent[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["include_checksum"], true);
        assert_eq!(body["raw_data"], true);
    }

    #[tokio::test]
    async fn malformed_line_is_a_codec_error() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(Method::Post, "/sync/stream", 200, "not json\n");
        let transport = transport(client);
        let cancel = CancelToken::new();
        let mut stream = transport
            .open_stream(&StreamingSyncRequest::new(Vec::new()), &cancel)
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(Err(SyncError::Codec(_)))));
    }

    #[tokio::test]
    async fn error_status_fails_open() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(Method::Post, "/sync/stream", 500, "boom");
        let transport = transport(client);
        let cancel = CancelToken::new();
        let result = transport
            .open_stream(&StreamingSyncRequest::new(Vec::new()), &cancel)
            .await;
        assert!(matches!(result, Err(SyncError::Http { status: 500, .. })));
    }
}
