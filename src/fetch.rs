//! HTTP page fetching with conditional requests and retry.
//!
//! [`HttpFetcher`] issues `GET` requests with a per-attempt timeout that
//! covers both the response headers and the body. When
//! stored validators are supplied, `If-None-Match` / `If-Modified-Since`
//! headers are sent and a `304 Not Modified` answer short-circuits as
//! [`FetchOutcome::NotModified`] without a body.
//!
//! # Retry Strategy
//!
//! Any non-2xx status, timeout, or transport error is retried up to
//! `retries` more times. The delay before attempt `n` (1-based retry
//! number) is `backoff * n`. The last error is surfaced when every
//! attempt fails.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, USER_AGENT};
use reqwest::StatusCode;
use thiserror::Error;

use docmirror_core::models::{FetchConditions, FetchMetadata};

use crate::config::CrawlConfig;

/// Why a fetch failed after all retries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("{0}")]
    Network(String),
}

/// A successfully downloaded page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub metadata: FetchMetadata,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(FetchedPage),
    /// The server confirmed the stored validators still match.
    NotModified(FetchMetadata),
}

/// Retry and timeout settings for one fetch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.fetch_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Source of page bodies for the crawler.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        conditions: Option<&FetchConditions>,
    ) -> Result<FetchOutcome, FetchError>;
}

/// [`PageFetcher`] over `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            policy,
        })
    }

    pub fn from_config(config: &CrawlConfig) -> anyhow::Result<Self> {
        Self::new(&config.user_agent, RetryPolicy::from_config(config))
    }

    /// One request, bounded by the policy timeout from send to last body byte.
    async fn attempt(
        &self,
        url: &str,
        conditions: Option<&FetchConditions>,
    ) -> Result<FetchOutcome, FetchError> {
        tokio::time::timeout(self.policy.timeout, self.request(url, conditions))
            .await
            .map_err(|_| FetchError::Timeout(self.policy.timeout.as_millis() as u64))?
    }

    async fn request(
        &self,
        url: &str,
        conditions: Option<&FetchConditions>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent);
        if let Some(conditions) = conditions {
            if let Some(etag) = &conditions.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &conditions.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        let metadata = FetchMetadata {
            etag: header_value(&response, ETAG.as_str()),
            last_modified: header_value(&response, LAST_MODIFIED.as_str()),
            status: Some(status.as_u16()),
            checked_at: Some(Utc::now()),
        };

        if status == StatusCode::NOT_MODIFIED && conditions.is_some() {
            return Ok(FetchOutcome::NotModified(metadata));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(FetchOutcome::Fetched(FetchedPage {
            url: url.to_string(),
            body,
            metadata,
        }))
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        conditions: Option<&FetchConditions>,
    ) -> Result<FetchOutcome, FetchError> {
        let conditions = conditions.filter(|c| !c.is_empty());
        let mut last_err = FetchError::Network(format!("no attempt made for {}", url));

        for attempt in 0..=self.policy.retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.backoff * attempt).await;
            }
            match self.attempt(url, conditions).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    tracing::debug!(url = %url, attempt, error = %e, "fetch attempt failed");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}
