//! Snapshot feed backed by a JSON HTTP endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use super::retry::{RetryExecutor, RetryPolicy, Transient};
use super::snapshot::Snapshot;
use super::traits::SnapshotFeed;

/// Failure of a single snapshot request.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("snapshot endpoint returned HTTP {status}")]
    Http { status: u16 },

    #[error("snapshot request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("snapshot body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("snapshot body is not a JSON object")]
    NotAnObject,

    #[error("snapshot request timed out after {0:?}")]
    Timeout(Duration),
}

impl Transient for FeedError {
    fn status_code(&self) -> Option<u16> {
        match self {
            FeedError::Http { status } => Some(*status),
            FeedError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            FeedError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            FeedError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Polls a URL that returns one snapshot object per request.
pub struct HttpSnapshotFeed {
    http: Client,
    url: String,
    retry: RetryExecutor,
}

impl HttpSnapshotFeed {
    /// Create a feed for `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, request_timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            url: url.into(),
            retry: RetryExecutor::new(retry),
        })
    }

    async fn fetch_once(&self) -> std::result::Result<Snapshot, FeedError> {
        let response = self.http.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Http {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        Snapshot::from_value(value).ok_or(FeedError::NotAnObject)
    }
}

#[async_trait]
impl SnapshotFeed for HttpSnapshotFeed {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Snapshot> {
        let snapshot = self
            .retry
            .execute(|| self.fetch_once())
            .await
            .context("Failed to fetch snapshot")?;

        debug!(fields = snapshot.len(), "Snapshot received");
        Ok(snapshot)
    }
}
