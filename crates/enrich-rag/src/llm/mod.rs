//! Classification/extraction service access.
//!
//! The engine never drafts prose; it only issues short classification and
//! extraction prompts. Every such call goes through [`CallGateway`], which
//! owns the rate limiter, the retry policy and the call metrics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub mod gateway;
pub mod openai;

pub use gateway::{CallGateway, GatewayMetrics, MetricsSnapshot, RetryPolicy};
pub use openai::OpenAiCompatibleService;

/// A single classification or extraction prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: usize,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Raw completion text plus token usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Core trait for the external classification/extraction service.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    fn name(&self) -> &str;

    /// Run one prompt. Implementations report HTTP 429 (or equivalent) as
    /// [`GatewayError::RateLimited`] so the gateway can back off.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError>;
}
