use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{scoped_query, SearchHit, SearchProvider};
use crate::error::SearchError;

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// Brave Search web API.
pub struct BraveSearch {
    api_key: String,
    client: Client,
}

impl BraveSearch {
    pub fn new(api_key: String, timeout_secs: u64) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| SearchError::Provider {
                provider: "brave".into(),
                message: e.to_string(),
            })?;
        Ok(Self { api_key, client })
    }
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

fn strip_markup(text: &str) -> String {
    text.replace("<strong>", "").replace("</strong>", "")
}

#[async_trait]
impl SearchProvider for BraveSearch {
    fn name(&self) -> &str {
        "brave"
    }

    async fn search(
        &self,
        query: &str,
        domain_filter: &[String],
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let q = scoped_query(query, domain_filter);
        let count = max_results.min(20).to_string();

        let response = self
            .client
            .get(BRAVE_ENDPOINT)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.as_str()), ("count", count.as_str())])
            .send()
            .await
            .map_err(|e| SearchError::Provider {
                provider: "brave".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                provider: "brave".into(),
                status_code: status.as_u16(),
            });
        }

        let parsed: BraveResponse = response.json().await.map_err(|e| SearchError::Provider {
            provider: "brave".into(),
            message: format!("invalid response: {}", e),
        })?;

        Ok(parsed
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(max_results)
            .map(|r| SearchHit::snippet(strip_markup(&r.title), r.url, strip_markup(&r.description), "brave"))
            .collect())
    }
}
