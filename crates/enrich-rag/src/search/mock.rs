//! Deterministic mock search.
//!
//! Produces plausible results derived only from the query and domain filter,
//! so the full pipeline can run without credentials or network access. The
//! snippets deliberately carry no measurable values, which keeps mock data out
//! of fused facts.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{SearchHit, SearchProvider};
use crate::error::SearchError;

pub struct MockSearch;

const TEMPLATES: [(&str, &str); 4] = [
    ("Scheda prodotto", "Panoramica delle caratteristiche principali del prodotto."),
    ("Guida all'acquisto", "Cosa valutare prima di scegliere questo prodotto."),
    ("Domande frequenti", "Risposte alle domande più comuni sul prodotto."),
    ("Opinioni utenti", "Esperienze d'uso raccolte dagli acquirenti."),
];

fn seed(query: &str, domains: &[String]) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(query.to_lowercase().as_bytes());
    for domain in domains {
        hasher.update(domain.as_bytes());
    }
    let digest = hasher.finalize();
    digest[0] as usize
}

fn slug(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

pub fn mock_results(query: &str, domain_filter: &[String], count: usize) -> Vec<SearchHit> {
    let offset = seed(query, domain_filter);
    let host = domain_filter
        .first()
        .cloned()
        .unwrap_or_else(|| "example.com".to_string());

    (0..count.min(TEMPLATES.len()))
        .map(|i| {
            let (title, body) = TEMPLATES[(offset + i) % TEMPLATES.len()];
            SearchHit::snippet(
                format!("{} - {}", title, query),
                format!("https://{}/{}/{}", host, slug(query), i + 1),
                body,
                "mock",
            )
        })
        .collect()
}

#[async_trait]
impl SearchProvider for MockSearch {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search(
        &self,
        query: &str,
        domain_filter: &[String],
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        Ok(mock_results(query, domain_filter, max_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_is_deterministic() {
        let domains = vec!["brandx.com".to_string()];
        assert_eq!(mock_results("trapano", &domains, 3), mock_results("trapano", &domains, 3));
    }

    #[test]
    fn test_mock_respects_count_and_domain() {
        let hits = mock_results("trapano 18v", &["amazon.it".to_string()], 2);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].url.starts_with("https://amazon.it/trapano-18v/"));
    }

    #[test]
    fn test_mock_snippets_carry_no_digits() {
        for hit in mock_results("trapano 18V DHP486Z", &[], 4) {
            assert!(!hit.snippet.chars().any(|c| c.is_ascii_digit()));
        }
    }
}
