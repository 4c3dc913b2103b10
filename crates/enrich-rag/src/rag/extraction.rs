//! Fact extraction from retrieved evidence.
//!
//! Snippets go through a deterministic unit-pattern extractor; listings
//! contribute their structured attributes and price; `Fact` evidence passes
//! through. Optionally a model pass recovers facts from snippets the patterns
//! missed, falling back to the deterministic result on any failure.

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use serde::Deserialize;

use super::fusion_executor::normalize_field_key;
use super::response::ModelReply;
use crate::llm::{CallGateway, CompletionRequest};
use crate::types::{Evidence, RetrievedItem, SourceFact};

const NUM: &str = r"(\d+(?:[.,]\d+)*)";

struct UnitPattern {
    field: &'static str,
    unit: &'static str,
    regex: LazyLock<regex::Regex>,
}

macro_rules! unit_pattern {
    ($field:expr, $unit:expr, $suffix:expr) => {
        UnitPattern {
            field: $field,
            unit: $unit,
            regex: LazyLock::new(|| {
                regex::Regex::new(&format!(r"(?i)\b{}\s*{}", NUM, $suffix)).expect("unit regex is valid")
            }),
        }
    };
}

static UNIT_PATTERNS: [UnitPattern; 6] = [
    unit_pattern!("torque", "Nm", r"n\s?[·.]?\s?m\b"),
    unit_pattern!("battery_capacity", "Ah", r"ah\b"),
    unit_pattern!("voltage", "V", r"(?:v|volt)\b"),
    unit_pattern!("weight", "kg", r"kg\b"),
    unit_pattern!("speed", "rpm", r"(?:rpm|giri/min|min-1)"),
    unit_pattern!("power", "W", r"(?:w|watt)\b"),
];

static PRICE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)€\s*(\d+(?:[.,]\d+)*)|\b(\d+(?:[.,]\d+)*)\s*(?:€|euro\b|eur\b)|\$\s*(\d+(?:[.,]\d+)*)")
        .expect("price regex is valid")
});

/// Deterministic facts found in free text, one per field (first mention wins).
pub fn extract_unit_facts(text: &str) -> Vec<(String, String)> {
    let mut facts = Vec::new();
    for pattern in UNIT_PATTERNS.iter() {
        if let Some(caps) = pattern.regex.captures(text) {
            if let Some(number) = caps.get(1) {
                facts.push((pattern.field.to_string(), format!("{} {}", number.as_str(), pattern.unit)));
            }
        }
    }
    if let Some(price) = extract_price(text) {
        facts.push(("price".to_string(), price));
    }
    facts
}

fn extract_price(text: &str) -> Option<String> {
    let caps = PRICE_RE.captures(text)?;
    if let Some(n) = caps.get(1).or_else(|| caps.get(2)) {
        return Some(format!("{} €", n.as_str()));
    }
    caps.get(3).map(|n| format!("{} $", n.as_str()))
}

fn source_fact(item: &RetrievedItem, field: String, value: String) -> SourceFact {
    SourceFact {
        field,
        value,
        source: item.category,
        source_url: item.evidence.url().map(str::to_string),
        reliability: item.reliability,
        timestamp: item.retrieved_at,
    }
}

/// Deterministic extraction for one item.
pub fn facts_from_item(item: &RetrievedItem) -> Vec<SourceFact> {
    match &item.evidence {
        Evidence::Snippet { text, .. } => extract_unit_facts(text)
            .into_iter()
            .map(|(field, value)| source_fact(item, field, value))
            .collect(),
        Evidence::Fact { field, value } => {
            vec![source_fact(item, normalize_field_key(field), value.trim().to_string())]
        }
        Evidence::Listing { price, attributes, .. } => {
            let mut facts = Vec::new();
            for (key, value) in attributes {
                // Prefer the canonical field when the value carries a recognised unit
                let unit_facts = extract_unit_facts(value);
                let key = normalize_field_key(key);
                match unit_facts.into_iter().find(|(field, _)| *field == key) {
                    Some((field, canonical)) => facts.push(source_fact(item, field, canonical)),
                    None => facts.push(source_fact(item, key, value.trim().to_string())),
                }
            }
            if let Some(price) = price {
                let value = extract_price(price).unwrap_or_else(|| price.trim().to_string());
                facts.push(source_fact(item, "price".to_string(), value));
            }
            facts
        }
    }
}

// ============================================================================
// Extractor
// ============================================================================

pub struct FactExtractor {
    gateway: Option<Arc<CallGateway>>,
}

impl FactExtractor {
    pub fn new() -> Self {
        Self { gateway: None }
    }

    pub fn with_gateway(mut self, gateway: Arc<CallGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub async fn extract(&self, items: &[RetrievedItem]) -> Vec<SourceFact> {
        let mut facts: Vec<SourceFact> = items.iter().flat_map(facts_from_item).collect();

        if let Some(gateway) = &self.gateway {
            // Only snippets the patterns found nothing in
            let pending: Vec<usize> = items
                .iter()
                .enumerate()
                .filter(|(_, item)| matches!(item.evidence, Evidence::Snippet { .. }))
                .filter(|(_, item)| facts_from_item(item).is_empty())
                .map(|(i, _)| i)
                .collect();

            if !pending.is_empty() {
                match self.extract_with_model(items, &pending, gateway).await {
                    Ok(model_facts) => {
                        tracing::debug!(count = model_facts.len(), "Model extraction added facts");
                        facts.extend(model_facts);
                    }
                    Err(e) => tracing::warn!(error = %e, "Model extraction failed, keeping pattern facts"),
                }
            }
        }

        tracing::debug!(items = items.len(), facts = facts.len(), "Facts extracted");
        facts
    }

    async fn extract_with_model(
        &self,
        items: &[RetrievedItem],
        pending: &[usize],
        gateway: &CallGateway,
    ) -> Result<Vec<SourceFact>> {
        let listing: Vec<String> = pending
            .iter()
            .enumerate()
            .filter_map(|(n, &i)| match &items[i].evidence {
                Evidence::Snippet { text, .. } => Some(format!("[{}] {}", n + 1, text)),
                _ => None,
            })
            .collect();
        let prompt = format!("Snippets:\n{}\nJSON:", listing.join("\n"));

        let completion = gateway
            .call(&CompletionRequest::new(prompt, gateway.max_tokens()).with_system(EXTRACTION_SYSTEM_PROMPT))
            .await
            .context("Model extraction call failed")?;

        let parsed: ModelExtraction = ModelReply::parse(&completion.text)
            .decode()
            .context("Unparsable extraction output")?;

        Ok(parsed
            .facts
            .into_iter()
            .filter_map(|f| {
                let index = *pending.get(f.snippet.checked_sub(1)?)?;
                let value = f.value.trim().to_string();
                if value.is_empty() {
                    return None;
                }
                Some(source_fact(&items[index], normalize_field_key(&f.field), value))
            })
            .collect())
    }
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new()
    }
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"Extract product facts from numbered snippets. Output ONLY a JSON object:

{"facts":[{"snippet":1,"field":"torque","value":"135 Nm"}]}

Use short snake_case field names. Only facts stated in the snippet; never guess."#;

#[derive(Debug, Deserialize)]
struct ModelExtraction {
    #[serde(default)]
    facts: Vec<ModelFact>,
}

#[derive(Debug, Deserialize)]
struct ModelFact {
    snippet: usize,
    field: String,
    value: String,
}
