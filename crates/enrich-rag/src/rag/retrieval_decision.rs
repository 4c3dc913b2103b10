//! Retrieval Decision System
//!
//! Decides whether a request needs external lookup at all. This is the main
//! cost-control short-circuit of the pipeline: an `Unnecessary` verdict skips
//! routing, retrieval and fusion entirely.
//!
//! Rule order:
//! 1. hard patterns (prices, model numbers, brand + number, spec / review /
//!    availability keywords) always require retrieval
//! 2. generic domain-concept questions are answerable from background knowledge
//! 3. structural heuristics for what is left
//!
//! A model-assisted classifier may override steps 2 and 3, never step 1.

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::response::ModelReply;
use crate::llm::{CallGateway, CompletionRequest};
use crate::types::EnrichmentRequest;

static PRICE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)[€$£]|\b\d+(?:[.,]\d+)?\s*(?:euro|eur|usd)\b").expect("price regex is valid")
});
static MODEL_NUMBER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b[A-Z]{1,5}-?\d{2,5}[A-Z]{0,3}\b").expect("model number regex is valid")
});
static PRICE_WORDS_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(?:prezz[oi]|prices?|quanto costa|cost[oi]|offert[ae]|scont[oi]|disponibil\w*|availability|in stock|spedizion[ei])\b",
    )
    .expect("price keyword regex is valid")
});
static SPEC_WORDS_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(?:specs?|specifich[ea]|specifica|specifications?|scheda tecnica|dati tecnici|caratteristiche tecniche|coppia|torque|voltaggio|potenza|dimensioni|peso|autonomia|compatibil\w*)\b",
    )
    .expect("spec keyword regex is valid")
});
static REVIEW_WORDS_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(?:recension\w*|reviews?|opinion\w*|esperienz\w*|pro e contro|vale la pena|conviene|affidabil\w*)\b",
    )
    .expect("review keyword regex is valid")
});
static CONCEPT_WORDS_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(?:cos'è|cosa è|cosa sono|che cosa è|what is an?|what are|come funzion(?:a|ano)|how does|how do|a cosa serve|differenza tra|perché|why|spiegami|explain|significato|definizione)\b",
    )
    .expect("concept keyword regex is valid")
});

/// Brands recognised in free text when the request carries no vendor.
const KNOWN_BRANDS: &[&str] = &[
    "makita", "bosch", "dewalt", "milwaukee", "metabo", "hilti", "ryobi", "einhell", "stanley", "hikoki",
];

// ============================================================================
// Core Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalNecessity {
    Required,
    Optional,
    Unnecessary,
}

impl RetrievalNecessity {
    /// Estimated share of retrieval cost avoided.
    pub fn estimated_savings(&self) -> f32 {
        match self {
            RetrievalNecessity::Required => 0.0,
            RetrievalNecessity::Optional => 0.4,
            RetrievalNecessity::Unnecessary => 0.85,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "required" => Some(RetrievalNecessity::Required),
            "optional" => Some(RetrievalNecessity::Optional),
            "unnecessary" | "not_needed" | "none" => Some(RetrievalNecessity::Unnecessary),
            _ => None,
        }
    }
}

/// What kind of knowledge the request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeClass {
    /// Identifies a specific product (model number, brand + number).
    ProductSpecific,
    /// Prices and availability.
    TimeSensitive,
    Specification,
    Experiential,
    /// Generic concept stable enough for background knowledge.
    DomainConcept,
    General,
}

impl KnowledgeClass {
    fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "product_specific" => Some(KnowledgeClass::ProductSpecific),
            "time_sensitive" => Some(KnowledgeClass::TimeSensitive),
            "specification" => Some(KnowledgeClass::Specification),
            "experiential" => Some(KnowledgeClass::Experiential),
            "domain_concept" => Some(KnowledgeClass::DomainConcept),
            "general" => Some(KnowledgeClass::General),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Run the whole fusion plan.
    Full,
    /// Retrieve from a reduced set of sources.
    Light { max_sources: usize },
    /// Answer from background knowledge; no retrieval.
    Parametric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalDecision {
    pub necessity: RetrievalNecessity,
    pub knowledge_class: KnowledgeClass,
    pub strategy: RetrievalStrategy,
    pub estimated_savings: f32,
    pub rationale: String,
    /// Set by the model-assisted classifier when it overrode the rules.
    #[serde(default)]
    pub model_override: bool,
}

impl RetrievalDecision {
    fn new(necessity: RetrievalNecessity, knowledge_class: KnowledgeClass, rationale: impl Into<String>) -> Self {
        let strategy = match necessity {
            RetrievalNecessity::Required => RetrievalStrategy::Full,
            RetrievalNecessity::Optional => RetrievalStrategy::Light {
                max_sources: LIGHT_MAX_SOURCES,
            },
            RetrievalNecessity::Unnecessary => RetrievalStrategy::Parametric,
        };
        Self {
            necessity,
            knowledge_class,
            strategy,
            estimated_savings: necessity.estimated_savings(),
            rationale: rationale.into(),
            model_override: false,
        }
    }

    pub fn should_retrieve(&self) -> bool {
        self.necessity != RetrievalNecessity::Unnecessary
    }
}

const LIGHT_MAX_SOURCES: usize = 2;

/// Rule outcome plus whether it came from a hard pattern.
struct RuleOutcome {
    decision: RetrievalDecision,
    hard: bool,
}

// ============================================================================
// Detector
// ============================================================================

pub struct NoRetrievalDetector {
    gateway: Option<Arc<CallGateway>>,
}

impl NoRetrievalDetector {
    pub fn new() -> Self {
        Self { gateway: None }
    }

    /// Enable the model-assisted override.
    pub fn with_gateway(mut self, gateway: Arc<CallGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Rule layer only.
    pub fn classify(&self, request: &EnrichmentRequest) -> RetrievalDecision {
        self.classify_rules(request).decision
    }

    /// Rule layer, then the model override where allowed.
    pub async fn detect(&self, request: &EnrichmentRequest) -> RetrievalDecision {
        let outcome = self.classify_rules(request);
        let decision = match (&self.gateway, outcome.hard) {
            (Some(gateway), false) => match self.classify_with_model(request, gateway).await {
                Ok(model) => model,
                Err(e) => {
                    tracing::warn!(error = %e, "Model retrieval classification failed, using rules");
                    outcome.decision
                }
            },
            _ => outcome.decision,
        };

        tracing::info!(
            necessity = ?decision.necessity,
            knowledge = ?decision.knowledge_class,
            savings = decision.estimated_savings,
            model_override = decision.model_override,
            rationale = %decision.rationale,
            "Retrieval decision"
        );
        decision
    }

    fn classify_rules(&self, request: &EnrichmentRequest) -> RuleOutcome {
        let text = request.intent.trim();
        let lower = text.to_lowercase().replace('\u{2019}', "'");

        // Step 1: hard "must retrieve" patterns
        if let Some(model) = self.find_model_number(text).or_else(|| self.find_model_number(&request.sku)) {
            return hard(KnowledgeClass::ProductSpecific, format!("model number '{}'", model));
        }
        if PRICE_RE.is_match(text) || self.is_price_request(&lower) {
            return hard(KnowledgeClass::TimeSensitive, "price or availability requested");
        }
        if self.is_brand_number(text, &request.vendor) {
            return hard(KnowledgeClass::ProductSpecific, "brand with number");
        }
        if self.is_spec_request(&lower) {
            return hard(KnowledgeClass::Specification, "specification keywords");
        }
        if self.is_review_request(&lower) {
            return hard(KnowledgeClass::Experiential, "review keywords");
        }

        // Step 2: parametric knowledge is enough
        if self.is_concept_question(&lower) {
            return soft(
                RetrievalNecessity::Unnecessary,
                KnowledgeClass::DomainConcept,
                "generic concept question",
            );
        }

        // Step 3: structural heuristics
        let has_digits = text.chars().any(|c| c.is_ascii_digit());
        if self.is_bare_question(&lower) && !has_digits {
            return soft(
                RetrievalNecessity::Optional,
                KnowledgeClass::General,
                "question without brand or number",
            );
        }
        if request.is_product_enrichment() {
            return soft(
                RetrievalNecessity::Required,
                KnowledgeClass::ProductSpecific,
                "product enrichment request",
            );
        }
        soft(RetrievalNecessity::Optional, KnowledgeClass::General, "no decisive pattern")
    }

    fn find_model_number(&self, text: &str) -> Option<String> {
        if let Some(m) = MODEL_NUMBER_RE.find(text) {
            return Some(m.as_str().to_string());
        }
        // Lower-case or mixed codes such as "dhp486z"
        text.split(|c: char| c.is_whitespace() || c == ',' || c == '?' || c == '(' || c == ')')
            .find(|token| {
                let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
                let letters = token.chars().filter(|c| c.is_ascii_alphabetic()).count();
                digits >= 3 && letters >= 1 && token.len() >= 5
            })
            .map(str::to_string)
    }

    fn is_price_request(&self, query: &str) -> bool {
        PRICE_WORDS_RE.is_match(query)
    }

    /// A number plus a brand named as whole words: the request vendor or
    /// one of [`KNOWN_BRANDS`].
    fn is_brand_number(&self, text: &str, vendor: &str) -> bool {
        let has_number = text.chars().filter(|c| c.is_ascii_digit()).count() >= 2;
        if !has_number {
            return false;
        }
        let words = word_tokens(text);
        let vendor_words = word_tokens(vendor);
        if !vendor_words.is_empty() && contains_run(&words, &vendor_words) {
            return true;
        }
        KNOWN_BRANDS.iter().any(|brand| words.iter().any(|w| w == brand))
    }

    fn is_spec_request(&self, query: &str) -> bool {
        SPEC_WORDS_RE.is_match(query)
    }

    fn is_review_request(&self, query: &str) -> bool {
        REVIEW_WORDS_RE.is_match(query)
    }

    fn is_concept_question(&self, query: &str) -> bool {
        CONCEPT_WORDS_RE.is_match(query)
    }

    fn is_bare_question(&self, query: &str) -> bool {
        let interrogatives = ["come", "quale", "quali", "quando", "dove", "chi", "how", "which", "when", "where"];
        query.ends_with('?')
            || interrogatives
                .iter()
                .any(|w| query.split_whitespace().next() == Some(*w))
    }

    async fn classify_with_model(
        &self,
        request: &EnrichmentRequest,
        gateway: &CallGateway,
    ) -> Result<RetrievalDecision> {
        let prompt = format!(
            "{}\nRequest: \"{}\"\nJSON:",
            request.product_context(),
            request.intent
        );
        let completion = gateway
            .call(&CompletionRequest::new(prompt, gateway.max_tokens()).with_system(DETECTOR_SYSTEM_PROMPT))
            .await
            .context("Model retrieval classification call failed")?;
        parse_detector_response(&completion.text)
    }
}

impl Default for NoRetrievalDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn word_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `needle` occurs as consecutive whole words of `haystack`.
fn contains_run(haystack: &[String], needle: &[String]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn hard(knowledge_class: KnowledgeClass, rationale: impl Into<String>) -> RuleOutcome {
    RuleOutcome {
        decision: RetrievalDecision::new(RetrievalNecessity::Required, knowledge_class, rationale),
        hard: true,
    }
}

fn soft(necessity: RetrievalNecessity, knowledge_class: KnowledgeClass, rationale: impl Into<String>) -> RuleOutcome {
    RuleOutcome {
        decision: RetrievalDecision::new(necessity, knowledge_class, rationale),
        hard: false,
    }
}

// ============================================================================
// Model path
// ============================================================================

const DETECTOR_SYSTEM_PROMPT: &str = r#"Decide whether answering a product enrichment request needs external lookup. Output ONLY a JSON object:

{"necessity":"required|optional|unnecessary","knowledge_class":"product_specific|time_sensitive|specification|experiential|domain_concept|general","rationale":"..."}

- unnecessary: generic, stable knowledge any expert knows.
- required: facts about a specific product, prices, availability, reviews."#;

#[derive(Debug, Deserialize)]
struct ModelDetection {
    necessity: String,
    #[serde(default)]
    knowledge_class: Option<String>,
    #[serde(default)]
    rationale: String,
}

fn parse_detector_response(raw: &str) -> Result<RetrievalDecision> {
    let reply = ModelReply::parse(raw);
    let parsed = match reply.decode::<ModelDetection>() {
        Some(parsed) => parsed,
        None => ModelDetection {
            necessity: reply.string("necessity").context("Detector output has no necessity")?,
            knowledge_class: reply.string("knowledge_class"),
            rationale: reply.string("rationale").unwrap_or_default(),
        },
    };

    let necessity = RetrievalNecessity::from_label(&parsed.necessity)
        .with_context(|| format!("Unknown necessity '{}'", parsed.necessity))?;
    let knowledge_class = parsed
        .knowledge_class
        .as_deref()
        .and_then(KnowledgeClass::from_label)
        .unwrap_or(KnowledgeClass::General);

    let mut decision = RetrievalDecision::new(necessity, knowledge_class, format!("model: {}", parsed.rationale));
    decision.model_override = true;
    Ok(decision)
}
