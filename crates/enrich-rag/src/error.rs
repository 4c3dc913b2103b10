//! Error types for the enrichment engine.
//!
//! Each external seam (classification service, web search, cache store) has
//! its own error enum. None of them escape `EnrichmentPipeline::enrich`.

use std::time::Duration;

use thiserror::Error;

/// Errors from the classification/extraction service and the call gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Rate limited by classification service, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Rate limit retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed service response: {0}")]
    Malformed(String),

    #[error("Classification service not configured")]
    NotConfigured,
}

impl GatewayError {
    /// Whether the gateway should retry this error with backoff.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GatewayError::RateLimited { .. })
    }

    /// Server-requested wait before the next attempt, when one was sent.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after_ms } if *retry_after_ms > 0 => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

/// Errors from web-search providers.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("Search provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Search provider '{provider}' returned status {status_code}")]
    Status { provider: String, status_code: u16 },

    #[error("No search provider available")]
    NoProvider,
}

/// Errors from a cache backend. Always degraded to a miss by `SearchCache`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Cache entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}
