//! Candidate supply
//!
//! The host application owns the catalog that maps a series/issue to cover
//! images; the engine only sees an ordered list of `(id, image)` pairs.
//! `CandidateSource` resolves a `CandidateTarget` into that list and
//! `ImageFetcher` downloads URL-only candidates lazily, on cache miss.

use async_trait::async_trait;
use coverid_common::{Error, Result};
use std::time::Duration;
use thiserror::Error;

use crate::models::{Candidate, CandidateTarget};

/// Resolves a target reference into candidate covers
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn resolve(&self, target: &CandidateTarget) -> Result<Vec<Candidate>>;
}

/// Source that only understands inline candidate lists
///
/// Series targets need a catalog-backed source registered by the host.
#[derive(Debug, Clone, Default)]
pub struct InlineCandidateSource;

#[async_trait]
impl CandidateSource for InlineCandidateSource {
    async fn resolve(&self, target: &CandidateTarget) -> Result<Vec<Candidate>> {
        match target {
            CandidateTarget::Inline { candidates } => Ok(candidates.clone()),
            CandidateTarget::Series { series, .. } => Err(Error::InvalidInput(format!(
                "no catalog configured to resolve series {:?}",
                series
            ))),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Downloads candidate image bytes
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

/// `reqwest`-backed fetcher with a per-request timeout
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coverid-matcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        tracing::debug!(url, "Fetching candidate image");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| FetchError::Request {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}
