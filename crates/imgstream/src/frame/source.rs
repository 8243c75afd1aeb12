//! Upstream frame sources.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Failure to obtain one frame, classified by whether the session can recover.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Timeout on a live connection or a malformed response. Retry next tick.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The upstream cannot be reached at all. The session is torn down.
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Fetches a single raw frame from an upstream.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError>;
}

/// Frame source issuing one HTTP GET per frame.
#[derive(Debug, Clone)]
pub struct HttpFrameSource {
    client: reqwest::Client,
}

impl HttpFrameSource {
    /// Build a source whose requests are bounded by `timeout` per attempt.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building frame source HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError> {
        let response = self.client.get(uri).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transient(format!("upstream returned {}", status)));
        }

        let frame = response.bytes().await.map_err(classify)?;
        if frame.is_empty() {
            return Err(FetchError::Transient("upstream returned an empty frame".to_string()));
        }

        Ok(frame)
    }
}

/// Map a transport error onto the session's recovery policy.
///
/// Deadlines are transient, even when they expire while connecting. Refused
/// connections, DNS failures, unusable URIs and connections dropped mid-request
/// are not.
fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Transient(err.to_string())
    } else if err.is_connect() || err.is_builder() || err.is_request() || err.is_body() {
        FetchError::Unreachable(err.to_string())
    } else {
        FetchError::Transient(err.to_string())
    }
}
