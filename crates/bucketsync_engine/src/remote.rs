//! Authenticated access to the sync service.

use crate::connector::{BackendConnector, Credentials};
use crate::error::{SyncError, SyncResult};
use crate::http::{ByteStream, HttpClient, HttpRequest, HttpResponse, Method};
use bucketsync_protocol::{OpId, WriteCheckpointResponse};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Caches credentials from the connector and issues requests with them.
pub struct Remote {
    connector: Arc<dyn BackendConnector>,
    client: Arc<dyn HttpClient>,
    cached: Mutex<Option<Credentials>>,
    refresh_margin: Duration,
    user_agent: String,
}

impl Remote {
    /// Creates a remote over `client`.
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        client: Arc<dyn HttpClient>,
        refresh_margin: Duration,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            client,
            cached: Mutex::new(None),
            refresh_margin,
            user_agent: user_agent.into(),
        }
    }

    /// Returns the user agent sent with every request.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Returns cached credentials, fetching new ones when none are cached or
    /// the cached ones expire within the refresh margin.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Credentials`] when the connector fails or has no
    /// credentials.
    pub async fn credentials(&self) -> SyncResult<Credentials> {
        let cached = self.cached.lock().clone();
        if let Some(cached) = cached {
            if !self.expires_soon(&cached) {
                return Ok(cached);
            }
        }

        match self.connector.fetch_credentials().await {
            Ok(Some(credentials)) => {
                tracing::debug!(endpoint = %credentials.endpoint, "fetched credentials");
                *self.cached.lock() = Some(credentials.clone());
                Ok(credentials)
            }
            Ok(None) => {
                self.invalidate_credentials();
                Err(SyncError::Credentials("not signed in".into()))
            }
            Err(err) => {
                self.invalidate_credentials();
                Err(match err {
                    SyncError::Credentials(_) | SyncError::Cancelled => err,
                    other => SyncError::Credentials(other.to_string()),
                })
            }
        }
    }

    /// Drops cached credentials so the next request fetches new ones.
    pub fn invalidate_credentials(&self) {
        *self.cached.lock() = None;
    }

    fn expires_soon(&self, credentials: &Credentials) -> bool {
        let Some(expires_at) = credentials.expires_at else {
            return false;
        };
        let margin = chrono::Duration::from_std(self.refresh_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());
        expires_at - margin <= Utc::now()
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> SyncResult<HttpResponse> {
        let credentials = self.credentials().await?;
        let mut request = HttpRequest::new(method, format!("{}{path}", credentials.endpoint))
            .with_header("Authorization", format!("Token {}", credentials.token))
            .with_header("User-Agent", self.user_agent.clone());
        if let Some(body) = body {
            request = request
                .with_header("Content-Type", "application/json")
                .with_body(body);
        }

        let response = self.client.send(request).await?;
        if response.status == 401 {
            self.invalidate_credentials();
            let message = body_text(response).await;
            tracing::warn!(%message, "credentials rejected");
            return Err(SyncError::AuthenticationFailed(message));
        }
        if !response.is_success() {
            let status = response.status;
            let message = body_text(response).await;
            return Err(SyncError::Http { status, message });
        }
        Ok(response)
    }

    /// Sends a GET to `path` and decodes the JSON response.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures, non-2xx statuses and bodies
    /// that do not decode as `T`.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        self.request(Method::Get, path, None).await?.json().await
    }

    /// POSTs `body` as JSON to `path` and returns the streamed response
    /// body.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures and non-2xx statuses.
    pub async fn post_stream<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> SyncResult<ByteStream> {
        let body = serde_json::to_vec(body).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(self.request(Method::Post, path, Some(body)).await?.body)
    }

    /// Asks the service for a checkpoint covering every write uploaded by
    /// `client_id` so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is malformed.
    pub async fn write_checkpoint(&self, client_id: &str) -> SyncResult<OpId> {
        let path = format!("/write-checkpoint2.json?client_id={client_id}");
        let response: WriteCheckpointResponse = self.get_json(&path).await?;
        tracing::debug!(op_id = %response.data.write_checkpoint, "write checkpoint");
        Ok(response.data.write_checkpoint)
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("user_agent", &self.user_agent)
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

async fn body_text(response: HttpResponse) -> String {
    let status = response.status;
    match response.bytes().await {
        Ok(bytes) if !bytes.is_empty() => String::from_utf8_lossy(&bytes).into_owned(),
        _ => format!("status {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockHttpClient};

    fn remote(connector: Arc<MockConnector>, client: Arc<MockHttpClient>) -> Remote {
        Remote::new(connector, client, Duration::from_secs(30), "test-agent")
    }

    #[tokio::test]
    async fn credentials_are_cached() {
        let connector = Arc::new(MockConnector::new(Credentials::new(
            "https://sync.example.com/",
            "t1",
        )));
        let remote = remote(Arc::clone(&connector), Arc::new(MockHttpClient::new()));

        let first = remote.credentials().await.unwrap();
        assert_eq!(first.endpoint, "https://sync.example.com");
        remote.credentials().await.unwrap();
        assert_eq!(connector.credential_fetches(), 1);

        remote.invalidate_credentials();
        remote.credentials().await.unwrap();
        assert_eq!(connector.credential_fetches(), 2);
    }

    #[tokio::test]
    async fn expiring_credentials_are_refreshed() {
        let soon = Utc::now() + chrono::Duration::seconds(10);
        let connector = Arc::new(MockConnector::new(
            Credentials::new("https://sync.example.com", "t1").with_expires_at(soon),
        ));
        let remote = remote(Arc::clone(&connector), Arc::new(MockHttpClient::new()));

        remote.credentials().await.unwrap();
        remote.credentials().await.unwrap();
        assert_eq!(connector.credential_fetches(), 2);
    }

    #[tokio::test]
    async fn signed_out_is_a_credentials_error() {
        let connector = Arc::new(MockConnector::signed_out());
        let remote = remote(connector, Arc::new(MockHttpClient::new()));
        assert!(matches!(
            remote.credentials().await,
            Err(SyncError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn write_checkpoint_sends_token_and_parses() {
        let connector = Arc::new(MockConnector::new(Credentials::new(
            "https://sync.example.com",
            "secret",
        )));
        let client = Arc::new(MockHttpClient::new());
        client.respond(
            Method::Get,
            "/write-checkpoint2.json",
            200,
            r#"{"data":{"write_checkpoint":"42"}}"#,
        );
        let remote = remote(connector, Arc::clone(&client));

        let op_id = remote.write_checkpoint("client-1").await.unwrap();
        assert_eq!(op_id, OpId::new(42));

        let sent = client.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].url,
            "https://sync.example.com/write-checkpoint2.json?client_id=client-1"
        );
        assert_eq!(sent[0].header("authorization"), Some("Token secret"));
        assert_eq!(sent[0].header("user-agent"), Some("test-agent"));
    }

    #[tokio::test]
    async fn unauthorized_invalidates_credentials() {
        let connector = Arc::new(MockConnector::new(Credentials::new(
            "https://sync.example.com",
            "stale",
        )));
        let client = Arc::new(MockHttpClient::new());
        client.respond(Method::Get, "/write-checkpoint2.json", 401, "expired");
        let remote = remote(Arc::clone(&connector), client);

        let err = remote.write_checkpoint("c").await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(ref m) if m == "expired"));

        remote.credentials().await.unwrap();
        assert_eq!(connector.credential_fetches(), 2);
    }

    #[tokio::test]
    async fn other_statuses_are_http_errors() {
        let connector = Arc::new(MockConnector::new(Credentials::new(
            "https://sync.example.com",
            "t",
        )));
        let client = Arc::new(MockHttpClient::new());
        client.respond(Method::Get, "/write-checkpoint2.json", 503, "");
        let remote = remote(connector, client);

        let err = remote.write_checkpoint("c").await.unwrap_err();
        assert!(matches!(err, SyncError::Http { status: 503, .. }));
        assert!(err.is_retryable());
    }
}
