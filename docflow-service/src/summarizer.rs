//! Summarization API boundary and client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SummarizerConfig;
use crate::error::SummarizerError;

/// Generation parameters for one summarization call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Summarization API boundary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Whether the client has everything it needs to make a call. Checked by
    /// the summarization stage before any API traffic happens.
    fn is_configured(&self) -> bool;

    async fn summarize(
        &self,
        text: &str,
        params: GenerationParams,
    ) -> Result<String, SummarizerError>;
}

/// HTTP client for an Ollama-style chat endpoint.
pub struct HttpSummarizer {
    client: Client,
    config: SummarizerConfig,
}

impl HttpSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SummarizerError::Connection {
                url: config.base_url.clone(),
                source: e,
            })?;

        Ok(Self { client, config })
    }

    /// Check if the summarizer endpoint is reachable
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.config.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    fn is_configured(&self) -> bool {
        if self.config.base_url.is_empty() || self.config.model.is_empty() {
            return false;
        }
        if self.config.require_api_key {
            return self
                .config
                .api_key
                .as_deref()
                .is_some_and(|key| !key.is_empty());
        }
        true
    }

    async fn summarize(
        &self,
        text: &str,
        params: GenerationParams,
    ) -> Result<String, SummarizerError> {
        let url = format!("{}/api/chat", self.config.base_url);

        let prompt = format!(
            "Summarize the following document in a few concise paragraphs. \
            Cover the main points and any conclusions; do not add commentary.\n\n{text}"
        );

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt,
            }],
            stream: false,
            options: ChatOptions {
                temperature: params.temperature,
                num_predict: params.max_output_tokens,
            },
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SummarizerError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(SummarizerError::Generation { status, message });
        }

        let chat_response: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| SummarizerError::InvalidResponse {
                    detail: e.to_string(),
                })?;

        let summary = chat_response.message.content.trim().to_string();
        if summary.is_empty() {
            return Err(SummarizerError::EmptySummary);
        }

        Ok(summary)
    }
}

// Internal API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}
