//! Historical record storage + HTTP fetch utilities for rentwatch.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, debug_span, Instrument};

mod history;

pub use history::{
    reconcile_tables, write_atomically, HistoricalTable, HistoryConfig, HistoryError, HistoryStore,
    PersistError, ReconcileAction, ReconcileOutcome, SchemaMismatch,
};
pub use reqwest::{header, StatusCode};

pub const CRATE_NAME: &str = "rentwatch-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Deadline applied to every request unless a call overrides it.
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("building http client")]
    Build(#[source] reqwest::Error),
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Thin wrapper over a shared `reqwest::Client`.
///
/// Non-success statuses are returned as responses, not errors; callers decide
/// what a failed status means for them.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(TransportError::Build)?;
        Ok(Self { client })
    }

    pub async fn post(
        &self,
        url: &str,
        headers: header::HeaderMap,
        body: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, TransportError> {
        let span = debug_span!("http_post", url);
        async {
            let mut request = self.client.post(url).headers(headers);
            if let Some(body) = body {
                request = request.body(body);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let request_error = |source| TransportError::Request {
                url: url.to_string(),
                source,
            };
            let resp = request.send().await.map_err(request_error)?;
            let status = resp.status();
            let body = resp.bytes().await.map_err(request_error)?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            Ok(FetchedResponse {
                status,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
