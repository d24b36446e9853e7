//! Transport from the device to the ingest endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use tally_events::{SyncBatch, SyncResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("ingest endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode ingest response: {0}")]
    Decode(String),
}

/// Submits batches to the ingest endpoint.
///
/// A transport never touches the ledger. Returning an error means nothing
/// is known about what the endpoint stored, so the whole batch is resent.
#[async_trait]
pub trait IngestTransport: Send + Sync {
    async fn submit(&self, batch: &SyncBatch) -> Result<SyncResponse, TransportError>;

    /// Cheap reachability probe used while offline.
    async fn check_connectivity(&self) -> bool {
        true
    }
}

#[async_trait]
impl<T> IngestTransport for Arc<T>
where
    T: IngestTransport + ?Sized,
{
    async fn submit(&self, batch: &SyncBatch) -> Result<SyncResponse, TransportError> {
        (**self).submit(batch).await
    }

    async fn check_connectivity(&self) -> bool {
        (**self).check_connectivity().await
    }
}

/// Upper bound on a single request, connect included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `reqwest` client for the ingest HTTP surface.
#[derive(Debug, Clone)]
pub struct HttpIngestClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpIngestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl IngestTransport for HttpIngestClient {
    async fn submit(&self, batch: &SyncBatch) -> Result<SyncResponse, TransportError> {
        let url = format!("{}/v1/sync/batches", self.base_url);
        let mut req = self.client.post(&url).timeout(self.timeout).json(batch);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        match resp.status() {
            StatusCode::OK | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => resp
                .json::<SyncResponse>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string())),
            status => Err(TransportError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn check_connectivity(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_dropped() {
        let client = HttpIngestClient::new("http://ingest.local:8080/").with_token("t");
        assert_eq!(client.base_url(), "http://ingest.local:8080");
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_disconnected() {
        // port 9 (discard) is never served in the test environment
        let client = HttpIngestClient::new("http://127.0.0.1:9");
        assert!(!client.check_connectivity().await);
    }

    /// Accepts connections and never writes a byte back.
    async fn silent_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (format!("http://{addr}"), task)
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        let (base_url, server) = silent_server().await;
        let client = HttpIngestClient::new(base_url).with_timeout(Duration::from_millis(200));

        let reachable = tokio::time::timeout(Duration::from_secs(5), client.check_connectivity())
            .await
            .unwrap();
        assert!(!reachable);

        let batch = SyncBatch::new(
            tally_events::ChainScope::new(
                tally_core::DeviceId::new("pos-7").unwrap(),
                tally_core::TenantId::new("brunch-co").unwrap(),
            ),
            Vec::new(),
        );
        let err = tokio::time::timeout(Duration::from_secs(5), client.submit(&batch))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));

        server.abort();
    }
}
