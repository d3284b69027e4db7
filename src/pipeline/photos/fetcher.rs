use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::PhotoConfig;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;

/// Downloads source photos with a per-request timeout and a body size cap
#[derive(Debug, Clone)]
pub struct PhotoFetcher {
    client: Client,
    max_bytes: usize,
}

impl PhotoFetcher {
    pub fn new(config: &PhotoConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build photo HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let failed = |reason: String| PipelineError::PhotoDownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self.client.get(url).send().await.map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status)));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(failed(format!("{} bytes exceeds limit of {}", len, self.max_bytes)));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            body.extend_from_slice(&chunk);
            if body.len() > self.max_bytes {
                return Err(failed(format!("body exceeds limit of {} bytes", self.max_bytes)));
            }
        }

        debug!("Downloaded {} ({} bytes)", url, body.len());
        metrics::photos::bytes_downloaded(body.len());
        Ok(body)
    }
}
