use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{scoped_query, SearchHit, SearchProvider};
use crate::error::SearchError;

const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";

/// Serper (Google results) API. Exposes structured attributes for some
/// product pages, which become listings at ingestion.
pub struct SerperSearch {
    api_key: String,
    client: Client,
}

impl SerperSearch {
    pub fn new(api_key: String, timeout_secs: u64) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| SearchError::Provider {
                provider: "serper".into(),
                message: e.to_string(),
            })?;
        Ok(Self { api_key, client })
    }
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Debug, Deserialize)]
struct SerperResult {
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    price: Option<serde_json::Value>,
}

impl SerperResult {
    fn into_hit(self) -> SearchHit {
        let price = match self.price {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let hit = self.attributes.into_iter().fold(
            SearchHit::snippet(self.title, self.link, self.snippet, "serper"),
            |hit, (key, value)| hit.with_attribute(key, value),
        );
        match price {
            Some(price) => hit.with_price(price),
            None => hit,
        }
    }
}

#[async_trait]
impl SearchProvider for SerperSearch {
    fn name(&self) -> &str {
        "serper"
    }

    async fn search(
        &self,
        query: &str,
        domain_filter: &[String],
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let body = json!({
            "q": scoped_query(query, domain_filter),
            "num": max_results.min(20),
            "gl": "it",
            "hl": "it"
        });

        let response = self
            .client
            .post(SERPER_ENDPOINT)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SearchError::Provider {
                provider: "serper".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                provider: "serper".into(),
                status_code: status.as_u16(),
            });
        }

        let parsed: SerperResponse = response.json().await.map_err(|e| SearchError::Provider {
            provider: "serper".into(),
            message: format!("invalid response: {}", e),
        })?;

        Ok(parsed
            .organic
            .into_iter()
            .take(max_results)
            .map(SerperResult::into_hit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_result_keeps_attributes() {
        let raw = r#"{"organic":[{"title":"Trapano","link":"https://shop.it/t","snippet":"s",
            "attributes":{"Coppia":"110 Nm"},"price":129.9}]}"#;
        let parsed: SerperResponse = serde_json::from_str(raw).unwrap();
        let hit = parsed.organic.into_iter().next().unwrap().into_hit();
        assert_eq!(hit.attributes, vec![("Coppia".to_string(), "110 Nm".to_string())]);
        assert_eq!(hit.price.as_deref(), Some("129.9"));
    }

    #[test]
    fn test_plain_result() {
        let raw = r#"{"organic":[{"title":"T","link":"https://x.it"}]}"#;
        let parsed: SerperResponse = serde_json::from_str(raw).unwrap();
        let hit = parsed.organic.into_iter().next().unwrap().into_hit();
        assert!(hit.attributes.is_empty());
        assert!(hit.price.is_none());
    }
}
