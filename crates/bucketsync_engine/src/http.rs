//! HTTP client abstraction.
//!
//! The engine never links an HTTP library itself. The host supplies an
//! [`HttpClient`] (reqwest, hyper, a platform fetch) and the engine builds
//! requests and consumes streamed response bodies through it.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::StreamExt;

/// A streamed response body.
pub type ByteStream = BoxStream<'static, SyncResult<Bytes>>;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
}

impl Method {
    /// Returns the method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response whose body arrives as a stream of chunks.
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body chunks.
    pub body: ByteStream,
}

impl HttpResponse {
    /// Creates a response from body chunks.
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    /// Creates a response with a complete body.
    pub fn full(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, stream::once(async move { Ok(body) }).boxed())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collects the whole body.
    ///
    /// # Errors
    ///
    /// Returns the first error the body stream yields.
    pub async fn bytes(mut self) -> SyncResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Collects the body and decodes it as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body fails or is not valid JSON for `T`.
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> SyncResult<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::Codec(e.to_string()))
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// HTTP client abstraction.
///
/// Implementations send the request and return as soon as the status is
/// known; the body is consumed lazily.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends `request`.
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_match_case_insensitively() {
        let request = HttpRequest::new(Method::Get, "https://sync.example.com/x")
            .with_header("Authorization", "Token abc");
        assert_eq!(request.header("authorization"), Some("Token abc"));
        assert_eq!(request.header("user-agent"), None);
        assert_eq!(request.method.as_str(), "GET");
    }

    #[tokio::test]
    async fn chunked_body_collects() {
        let chunks = vec![Ok(Bytes::from_static(b"{\"a\":")), Ok(Bytes::from_static(b"1}"))];
        let response = HttpResponse::new(200, stream::iter(chunks).boxed());
        assert!(response.is_success());
        let value: serde_json::Value = response.json().await.unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn body_error_propagates() {
        let chunks = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(SyncError::transport_retryable("reset")),
        ];
        let response = HttpResponse::new(200, stream::iter(chunks).boxed());
        assert!(matches!(
            response.bytes().await,
            Err(SyncError::Transport { .. })
        ));
    }
}
