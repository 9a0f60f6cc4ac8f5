// src/fetcher.rs - Injected network collaborator for artifact downloads

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Response header naming the algorithm the payload is compressed with.
/// Overrides the algorithm the request asked for when present.
pub const COMPRESSION_HEADER: &str = "x-model-compression";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Transport failure: {message}")]
    Transport { message: String },
    #[error("Request timed out")]
    Timeout,
    #[error("Server returned status {code}")]
    Status { code: u16 },
    #[error("No delta available for the requested base")]
    DeltaUnavailable,
    #[error("Invalid source URL: {url}")]
    InvalidUrl { url: String },
}

impl FetchError {
    /// Transient failures worth retrying; everything else is terminal for
    /// the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } | FetchError::Timeout => true,
            FetchError::Status { code } => *code >= 500,
            FetchError::DeltaUnavailable | FetchError::InvalidUrl { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub bytes: Bytes,
    /// Compression algorithm declared by the server, if any.
    pub compression: Option<String>,
}

/// Network fetch primitive. The loader owns strategy, retries and health
/// accounting; implementations only move bytes.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch_full(&self, url: &str) -> Result<FetchedPayload, FetchError>;

    /// Fetch a binary delta against the given base checksum. Returns
    /// `DeltaUnavailable` when the server cannot serve one.
    async fn fetch_delta(
        &self,
        url: &str,
        base_checksum: &str,
    ) -> Result<FetchedPayload, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            user_agent: "hybrid-model-loader/0.1".to_string(),
        }
    }
}

pub struct HttpModelFetcher {
    client: reqwest::Client,
}

impl HttpModelFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| FetchError::Transport {
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn get(&self, url: Url) -> Result<FetchedPayload, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }

        let compression = response
            .headers()
            .get(COMPRESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        // Stream the body rather than buffering it inside reqwest; model
        // payloads can run to hundreds of megabytes.
        let mut buf = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            buf.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = buf.len(), "fetched payload");
        Ok(FetchedPayload {
            bytes: buf.freeze(),
            compression,
        })
    }
}

#[async_trait]
impl ModelFetcher for HttpModelFetcher {
    async fn fetch_full(&self, url: &str) -> Result<FetchedPayload, FetchError> {
        let parsed = parse_url(url)?;
        self.get(parsed).await
    }

    async fn fetch_delta(
        &self,
        url: &str,
        base_checksum: &str,
    ) -> Result<FetchedPayload, FetchError> {
        let mut parsed = parse_url(url)?;
        parsed
            .query_pairs_mut()
            .append_pair("delta_base", base_checksum);

        match self.get(parsed).await {
            // 404/416: server has no delta against this base
            Err(FetchError::Status { code: 404 }) | Err(FetchError::Status { code: 416 }) => {
                Err(FetchError::DeltaUnavailable)
            }
            other => other,
        }
    }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|_| FetchError::InvalidUrl {
        url: url.to_string(),
    })
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport {
            message: e.to_string(),
        }
    }
}
