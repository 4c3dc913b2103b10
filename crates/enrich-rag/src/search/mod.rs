//! Web search abstraction.
//!
//! Several backends sit behind [`SearchProvider`]; [`SearchClient`] tries them
//! in order and falls back to the deterministic [`MockSearch`] when none is
//! configured (or, optionally, when every live backend fails).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{RetrievalMode, SearchConfig};
use crate::error::SearchError;
use crate::types::Evidence;

pub mod brave;
pub mod mock;
pub mod serper;

pub use brave::BraveSearch;
pub use mock::MockSearch;
pub use serper::SerperSearch;

/// One search backend result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub provider: String,
    /// Structured attributes when the backend exposes them (product listings).
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    #[serde(default)]
    pub price: Option<String>,
}

impl SearchHit {
    pub fn snippet(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
            provider: provider.into(),
            attributes: Vec::new(),
            price: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_price(mut self, price: impl Into<String>) -> Self {
        self.price = Some(price.into());
        self
    }

    /// Decide the evidence shape at ingestion: structured hits become
    /// listings, everything else a text snippet.
    pub fn to_evidence(&self) -> Evidence {
        if !self.attributes.is_empty() || self.price.is_some() {
            Evidence::Listing {
                title: self.title.clone(),
                url: self.url.clone(),
                price: self.price.clone(),
                attributes: self.attributes.clone(),
            }
        } else {
            Evidence::Snippet {
                title: self.title.clone(),
                url: self.url.clone(),
                text: self.snippet.clone(),
            }
        }
    }
}

/// Hits plus which provider answered.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub provider: String,
    /// Set when every live provider failed and the fallback answered.
    pub fallback: bool,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        domain_filter: &[String],
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError>;
}

/// Append `site:` restrictions for a domain filter.
pub fn scoped_query(query: &str, domain_filter: &[String]) -> String {
    match domain_filter.len() {
        0 => query.to_string(),
        1 => format!("{} site:{}", query, domain_filter[0]),
        _ => {
            let sites: Vec<String> = domain_filter.iter().map(|d| format!("site:{}", d)).collect();
            format!("{} ({})", query, sites.join(" OR "))
        }
    }
}

pub struct SearchClient {
    providers: Vec<Arc<dyn SearchProvider>>,
    fallback: Option<Arc<dyn SearchProvider>>,
    results_per_query: usize,
}

impl SearchClient {
    pub fn new(providers: Vec<Arc<dyn SearchProvider>>, results_per_query: usize) -> Self {
        Self {
            providers,
            fallback: None,
            results_per_query: results_per_query.max(1),
        }
    }

    /// Provider to use when the chain is empty or every provider failed.
    pub fn with_fallback(mut self, fallback: Arc<dyn SearchProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Build the provider chain from whichever credentials are configured.
    pub fn from_config(config: &SearchConfig) -> Self {
        let mock: Arc<dyn SearchProvider> = Arc::new(MockSearch);
        if config.mode == RetrievalMode::Mock {
            tracing::info!("Search client in mock mode");
            return Self::new(vec![mock], config.results_per_query);
        }

        let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();
        if let Some(key) = &config.brave_api_key {
            match BraveSearch::new(key.clone(), config.timeout_secs) {
                Ok(provider) => providers.push(Arc::new(provider)),
                Err(e) => tracing::warn!(error = %e, "Brave search unavailable"),
            }
        }
        if let Some(key) = &config.serper_api_key {
            match SerperSearch::new(key.clone(), config.timeout_secs) {
                Ok(provider) => providers.push(Arc::new(provider)),
                Err(e) => tracing::warn!(error = %e, "Serper search unavailable"),
            }
        }

        if providers.is_empty() {
            tracing::warn!("No search credentials configured, using deterministic mock search");
            return Self::new(vec![mock], config.results_per_query);
        }

        tracing::info!(
            providers = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            "Search client ready"
        );
        let client = Self::new(providers, config.results_per_query);
        if config.mock_fallback {
            client.with_fallback(mock)
        } else {
            client
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Search with ordered failover across providers.
    pub async fn search(&self, query: &str, domain_filter: &[String]) -> Result<SearchOutcome, SearchError> {
        let mut last_error = SearchError::NoProvider;

        for (i, provider) in self.providers.iter().enumerate() {
            match provider.search(query, domain_filter, self.results_per_query).await {
                Ok(hits) => {
                    tracing::debug!(provider = provider.name(), count = hits.len(), query, "Search succeeded");
                    return Ok(SearchOutcome {
                        hits,
                        provider: provider.name().to_string(),
                        fallback: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        attempt = i + 1,
                        total = self.providers.len(),
                        error = %e,
                        "Search provider failed, trying next"
                    );
                    last_error = e;
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            tracing::warn!(provider = fallback.name(), error = %last_error, "All search providers failed, using fallback");
            let hits = fallback.search(query, domain_filter, self.results_per_query).await?;
            return Ok(SearchOutcome {
                hits,
                provider: fallback.name().to_string(),
                fallback: true,
            });
        }

        Err(last_error)
    }
}
