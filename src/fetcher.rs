//! HTTP collaborators: one trait for feed documents, one for arbitrary pages.
//!
//! The synchronizer and extractor only see the traits, so tests can count and
//! script fetches without a network.

use async_trait::async_trait;
use feed_rs::model::Feed;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::types::{FeedrankError, FetchConfig, Result};

/// A fetched page: content type plus the body for textual content. Non-text
/// bodies are not materialized; the content type alone is enough for media
/// dispatch.
#[derive(Debug, Clone)]
pub struct Page {
    pub content_type: String,
    pub body: Option<String>,
}

/// Fetches arbitrary pages for metadata extraction.
#[async_trait]
pub trait PageFetch: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<Page>;
}

/// Fetches and parses a feed document.
#[async_trait]
pub trait FeedFetch: Send + Sync {
    async fn fetch_feed(&self, url: &str) -> Result<Feed>;
}

/// reqwest-backed implementation of both fetch traits.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FeedrankError::FetchUnavailable {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetch for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<Page> {
        debug!(url, "fetching page");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FeedrankError::FetchUnavailable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = if content_type.starts_with("text/") {
            Some(
                response
                    .text()
                    .await
                    .map_err(|e| FeedrankError::FetchUnavailable {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?,
            )
        } else {
            None
        };

        Ok(Page { content_type, body })
    }
}

#[async_trait]
impl FeedFetch for HttpFetcher {
    async fn fetch_feed(&self, url: &str) -> Result<Feed> {
        debug!(url, "fetching feed document");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FeedrankError::SourceUnavailable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FeedrankError::SourceUnavailable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        feed_rs::parser::parse(bytes.as_ref()).map_err(|e| FeedrankError::SourceUnavailable {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}
