use crate::worker::{PollError, SnapshotSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CACHE_CONTROL, PRAGMA};
use std::time::Duration;

const USER_AGENT: &str = concat!("snapcount/", env!("CARGO_PKG_VERSION"));

/// Fetches snapshot JPEGs over HTTP. Cameras tend to sit behind caching
/// proxies, hence the explicit no-cache headers.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PollError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "image/jpeg,*/*")
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await
            .map_err(|e| PollError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Fetch(format!("snapshot returned {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PollError::Fetch(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
