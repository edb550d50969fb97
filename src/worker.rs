//! HTTP client for the two downstream workers (summarizer and audio synthesis).
//!
//! Both workers accept a JSON job and acknowledge it immediately; their real
//! results come back later through the webhook ingress.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::config::Workers;

/// Job posted to the audio synthesis worker, one per unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioRequest {
    pub batch_id: String,
    pub unit_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Job posted to the summarization worker, one per participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    pub batch_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[async_trait]
pub trait WorkerService: Send + Sync {
    async fn request_summary(&self, req: &SummaryRequest) -> Result<()>;

    async fn request_audio(&self, req: &AudioRequest) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpWorkerClient {
    http: Client,
    summarizer_url: Url,
    audio_url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpWorkerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpWorkerClient")
            .field("summarizer_url", &self.summarizer_url)
            .field("audio_url", &self.audio_url)
            .finish_non_exhaustive()
    }
}

impl HttpWorkerClient {
    pub fn new(summarizer_url: Url, audio_url: Url, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("briefcast-orchestrator/0.1")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            http,
            summarizer_url,
            audio_url,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &Workers) -> Result<Self> {
        let summarizer = Url::parse(&cfg.summarizer_url).context("invalid workers.summarizer_url")?;
        let audio = Url::parse(&cfg.audio_url).context("invalid workers.audio_url")?;
        Self::new(summarizer, audio, cfg.token.clone())
    }

    pub fn build_request(&self, endpoint: &Url, body: &Value) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .post(endpoint.clone())
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.build().context("failed to build worker request")
    }

    async fn post(&self, endpoint: &Url, body: Value) -> Result<()> {
        let request = self.build_request(endpoint, &body)?;
        debug!(url = %request.url(), "posting worker job");

        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach worker at {}", endpoint))?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(url = %endpoint, "rate limited by worker: {}", body);
            return Err(anyhow!("received 429 from worker: {}", body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("worker error {}: {}", status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerService for HttpWorkerClient {
    async fn request_summary(&self, req: &SummaryRequest) -> Result<()> {
        let body = serde_json::to_value(req)?;
        self.post(&self.summarizer_url, body).await
    }

    async fn request_audio(&self, req: &AudioRequest) -> Result<()> {
        let body = serde_json::to_value(req)?;
        self.post(&self.audio_url, body).await
    }
}
