//! OpenAI-compatible chat completions client used for classification and
//! extraction prompts.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{ClassificationService, Completion, CompletionRequest};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::types::estimate_tokens;

pub struct OpenAiCompatibleService {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl OpenAiCompatibleService {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let endpoint = endpoint.into();
        let model = model.into();
        tracing::info!(endpoint = %endpoint, model = %model, "Creating classification service client");

        Ok(Self {
            endpoint,
            api_key,
            model,
            client,
        })
    }

    /// Build from config. Returns `None` when no endpoint is configured.
    pub fn from_config(config: &GatewayConfig) -> Option<Result<Self, GatewayError>> {
        let endpoint = config.endpoint.as_ref()?;
        Some(Self::new(
            endpoint.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.timeout_secs,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[async_trait]
impl ClassificationService for OpenAiCompatibleService {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": 0.0,
            "stream": false
        });

        tracing::debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            max_tokens = request.max_tokens,
            prompt_len = request.prompt.len(),
            "Sending classification request"
        );

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Network(format!("Request to {} timed out", self.endpoint))
            } else {
                GatewayError::Network(format!("Request to {} failed: {}", self.endpoint, e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(0);
            return Err(GatewayError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let preview: String = message.chars().take(300).collect();
            return Err(GatewayError::Api {
                status_code: status.as_u16(),
                message: preview,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(format!("Failed to read response body: {}", e)))?;
        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            GatewayError::Malformed(format!("{} (body: {})", e, preview))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GatewayError::Malformed("No choices returned from API".into()))?;

        let (prompt_tokens, completion_tokens) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (estimate_tokens(&request.prompt), estimate_tokens(&text)),
        };

        Ok(Completion {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}
