//! Agent-to-server push path: JSON envelope, gzip for large bodies, bearer
//! auth, exponential-backoff retry.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{HeartbeatPayload, MetricsPushPayload};

// Bodies above this size go out gzip-compressed.
const COMPRESSION_THRESHOLD: usize = 1024;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Outcome of a single HTTP attempt, split by whether a retry can help.
#[derive(Debug)]
enum SendError {
    /// 5xx, 429, or a transport failure.
    Retryable(anyhow::Error),
    /// Any other non-2xx status.
    Permanent(anyhow::Error),
}

pub struct Sender {
    server_url: String,
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Sender {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("fleetwatch-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build push http client")?;
        Ok(Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            client,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    /// Tunes the retry budget. Tests run with a near-zero backoff.
    pub fn with_retry(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    /// Pushes a full metrics snapshot. A sender without a server URL is a
    /// no-op, which is what standalone mode relies on.
    pub async fn push_metrics(
        &self,
        cancel: &CancellationToken,
        payload: &MetricsPushPayload,
    ) -> Result<()> {
        if self.server_url.is_empty() {
            return Ok(());
        }
        let endpoint = format!("{}/api/v1/metrics/push", self.server_url);
        self.send_with_retry(cancel, &endpoint, payload).await
    }

    pub async fn send_heartbeat(&self, cancel: &CancellationToken, agent_name: &str) -> Result<()> {
        if self.server_url.is_empty() {
            return Ok(());
        }
        let payload = HeartbeatPayload {
            agent_name: agent_name.to_string(),
            timestamp: Utc::now(),
        };
        let endpoint = format!("{}/api/v1/heartbeat", self.server_url);
        self.send_with_retry(cancel, &endpoint, &payload).await
    }

    async fn send_with_retry<T: Serialize>(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        payload: &T,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload).context("failed to serialize payload")?;

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff * 2u32.pow(attempt - 1);
                debug!(attempt, ?backoff, "retrying push");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => {
                        anyhow::bail!("push cancelled during retry backoff");
                    }
                }
            }

            match self.send_once(endpoint, &body).await {
                Ok(()) => return Ok(()),
                Err(SendError::Permanent(err)) => return Err(err),
                Err(SendError::Retryable(err)) => {
                    warn!(attempt, "push attempt failed: {err:#}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("push failed"))
            .context(format!("failed after {} retries", self.max_retries)))
    }

    async fn send_once(&self, endpoint: &str, json_body: &[u8]) -> Result<(), SendError> {
        let mut request = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if json_body.len() > COMPRESSION_THRESHOLD {
            let compressed = gzip(json_body).map_err(|err| {
                SendError::Permanent(anyhow::anyhow!(err).context("failed to gzip payload"))
            })?;
            request = request
                .header(reqwest::header::CONTENT_ENCODING, "gzip")
                .body(compressed);
        } else {
            request = request.body(json_body.to_vec());
        }

        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|err| {
            SendError::Retryable(anyhow::anyhow!(err).context("push request failed"))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let err = anyhow::anyhow!("server returned {status}: {body}");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SendError::Retryable(err))
        } else {
            Err(SendError::Permanent(err))
        }
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
