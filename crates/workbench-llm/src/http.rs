use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;
use workbench_core::WorkbenchConfig;

use crate::error::{Result, TransportError};
use crate::parser::frame_stream;
use crate::provider::{error_stream, CompletionRequest, CompletionService, FrameStream};

/// Completion service reached over HTTP, answering with a `data:` line
/// stream.
pub struct HttpCompletionService {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCompletionService {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    /// Build from configuration. The timeout bounds connecting only, since a
    /// streamed answer may legitimately take longer.
    pub fn from_config(config: &WorkbenchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|error| TransportError::InvalidRequest(error.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.stream_url(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn open_stream(&self, request: &CompletionRequest) -> Result<FrameStream> {
        log::debug!(
            "POST {} ({} message(s), evaluation: {})",
            self.endpoint,
            request.messages.len(),
            request.enable_evaluation
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(&request.to_body());
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::warn!("Completion service rejected request: HTTP {}", status);
            let message = if text.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                format!("HTTP {}: {}", status, text.trim())
            };
            return Ok(error_stream(message));
        }

        Ok(frame_stream(response.bytes_stream()))
    }
}
