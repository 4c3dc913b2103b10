//! Source Router
//!
//! Classifies the intent of an enrichment request and picks the source
//! categories worth consulting. Two strategies:
//!
//! - a curated keyword table (deterministic, fixed confidence per intent)
//! - model-assisted classification through the [`CallGateway`]
//!
//! When the rule layer is confident enough and ensembling is off, the model is
//! never called. Any model failure or unparsable output falls back silently to
//! the rule decision.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::response::ModelReply;
use crate::config::RouterConfig;
use crate::llm::{CallGateway, CompletionRequest};
use crate::types::SourceCategory::*;
use crate::types::{EnrichmentRequest, SourceCategory};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentClass {
    Specifications,
    Pricing,
    HowTo,
    Review,
    Comparison,
    WorthBuying,
    /// Generic concept question, answerable without product sources.
    Conceptual,
    General,
}

impl IntentClass {
    pub fn label(&self) -> &'static str {
        match self {
            IntentClass::Specifications => "specifications",
            IntentClass::Pricing => "pricing",
            IntentClass::HowTo => "how_to",
            IntentClass::Review => "review",
            IntentClass::Comparison => "comparison",
            IntentClass::WorthBuying => "worth_buying",
            IntentClass::Conceptual => "conceptual",
            IntentClass::General => "general",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "specifications" | "specs" | "spec" | "specification" => Some(IntentClass::Specifications),
            "pricing" | "price" => Some(IntentClass::Pricing),
            "how_to" | "howto" | "instructions" => Some(IntentClass::HowTo),
            "review" | "reviews" => Some(IntentClass::Review),
            "comparison" | "compare" => Some(IntentClass::Comparison),
            "worth_buying" | "worth" | "purchase_decision" => Some(IntentClass::WorthBuying),
            "conceptual" | "concept" | "definition" => Some(IntentClass::Conceptual),
            "general" => Some(IntentClass::General),
            _ => None,
        }
    }
}

/// Which strategy produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Rules,
    Model,
    Ensemble,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub intent_class: IntentClass,
    pub primary_sources: Vec<SourceCategory>,
    pub secondary_sources: Vec<SourceCategory>,
    pub confidence: f32,
    pub rationale: String,
    /// No source worth consulting: the request can be answered without retrieval.
    pub skip: bool,
    pub strategy: RoutingStrategy,
}

impl RoutingDecision {
    /// Primary sources first, then secondary, without duplicates.
    pub fn all_sources(&self) -> Vec<SourceCategory> {
        let mut sources = self.primary_sources.clone();
        for source in &self.secondary_sources {
            if !sources.contains(source) {
                sources.push(*source);
            }
        }
        sources
    }
}

// ============================================================================
// Rule table
// ============================================================================

struct IntentRule {
    class: IntentClass,
    keywords: &'static [&'static str],
    confidence: f32,
    primary: &'static [SourceCategory],
    secondary: &'static [SourceCategory],
}

const RULES: &[IntentRule] = &[
    IntentRule {
        class: IntentClass::Specifications,
        keywords: &[
            "specs", "spec", "specifiche", "specifica", "scheda tecnica", "dati tecnici",
            "caratteristiche tecniche", "specifications", "technical data", "coppia", "torque",
            "potenza", "voltaggio", "tensione", "dimensioni", "peso", "weight", "capacità",
        ],
        confidence: 0.9,
        primary: &[OfficialSpecs, Manuals],
        secondary: &[RetailerData, ComparisonSites],
    },
    IntentRule {
        class: IntentClass::Pricing,
        keywords: &[
            "prezzo", "prezzi", "price", "costo", "quanto costa", "offerta", "offerte", "sconto",
            "cost", "deal", "disponibilità", "disponibile", "availability", "in stock",
        ],
        confidence: 0.85,
        primary: &[RetailerData, ComparisonSites],
        secondary: &[OfficialSpecs],
    },
    IntentRule {
        class: IntentClass::HowTo,
        keywords: &[
            "come si usa", "come usare", "istruzioni", "how to", "how do i", "manuale", "manual",
            "montaggio", "installazione", "setup", "guida all'uso", "tutorial", "manutenzione",
        ],
        confidence: 0.8,
        primary: &[Manuals, Video],
        secondary: &[Forum, OfficialSpecs],
    },
    IntentRule {
        class: IntentClass::Comparison,
        keywords: &[
            "confronto", "confronta", "vs", "versus", "compare", "comparison", "meglio di",
            "better than", "alternativa", "alternative", "paragone",
        ],
        confidence: 0.8,
        primary: &[ComparisonSites, OfficialSpecs],
        secondary: &[UserReviews, RetailerData],
    },
    IntentRule {
        class: IntentClass::Review,
        keywords: &[
            "recensione", "recensioni", "review", "reviews", "opinioni", "opinione",
            "esperienza", "esperienze", "pro e contro", "pros and cons", "affidabile",
            "affidabilità", "difetti",
        ],
        confidence: 0.8,
        primary: &[UserReviews, Forum],
        secondary: &[Video, ComparisonSites],
    },
    IntentRule {
        class: IntentClass::WorthBuying,
        keywords: &[
            "vale la pena", "conviene", "worth", "should i buy", "merita", "consigliato",
            "consigli", "da comprare", "acquistare",
        ],
        confidence: 0.75,
        primary: &[UserReviews, OfficialSpecs, RetailerData],
        secondary: &[Forum, ComparisonSites],
    },
    IntentRule {
        class: IntentClass::Conceptual,
        keywords: &[
            "cos'è", "cosa è", "cosa sono", "che cos'è", "what is", "what are", "come funziona",
            "how does", "perché", "why", "spiegami", "explain", "significato", "meaning",
        ],
        confidence: 0.7,
        primary: &[],
        secondary: &[],
    },
];

const GENERAL_CONFIDENCE: f32 = 0.6;
const GENERAL_PRIMARY: &[SourceCategory] = &[OfficialSpecs, RetailerData];
const GENERAL_SECONDARY: &[SourceCategory] = &[UserReviews, ComparisonSites];

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Single words match whole tokens; phrases match as substrings.
fn matches_keyword(text: &str, tokens: &[String], keyword: &str) -> bool {
    if keyword.contains(' ') || keyword.contains('\'') {
        text.contains(keyword)
    } else {
        tokens.iter().any(|t| t == keyword)
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct Router {
    config: RouterConfig,
    gateway: Option<Arc<CallGateway>>,
    ensemble: bool,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            gateway: None,
            ensemble: false,
        }
    }

    /// Enable the model-assisted strategy.
    pub fn with_gateway(mut self, gateway: Arc<CallGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Always run both strategies and combine them.
    pub fn with_ensemble(mut self, ensemble: bool) -> Self {
        self.ensemble = ensemble;
        self
    }

    /// Deterministic keyword classification, before product-specific adjustments.
    pub fn route_rules(&self, request: &EnrichmentRequest) -> RoutingDecision {
        let text = request.intent.to_lowercase().replace('\u{2019}', "'");
        let tokens = tokenize(&text);

        let mut best: Option<(&IntentRule, Vec<&'static str>)> = None;
        for rule in RULES {
            let hits: Vec<&'static str> = rule
                .keywords
                .iter()
                .copied()
                .filter(|kw| matches_keyword(&text, &tokens, kw))
                .collect();
            if hits.is_empty() {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, current_hits)) => {
                    hits.len() > current_hits.len()
                        || (hits.len() == current_hits.len() && rule.confidence > current.confidence)
                }
            };
            if better {
                best = Some((rule, hits));
            }
        }

        match best {
            Some((rule, hits)) => RoutingDecision {
                intent_class: rule.class,
                primary_sources: rule.primary.to_vec(),
                secondary_sources: rule.secondary.to_vec(),
                confidence: rule.confidence,
                rationale: format!("keyword match: {}", hits.join(", ")),
                skip: rule.primary.is_empty(),
                strategy: RoutingStrategy::Rules,
            },
            None => RoutingDecision {
                intent_class: IntentClass::General,
                primary_sources: GENERAL_PRIMARY.to_vec(),
                secondary_sources: GENERAL_SECONDARY.to_vec(),
                confidence: GENERAL_CONFIDENCE,
                rationale: "no intent keyword matched".to_string(),
                skip: false,
                strategy: RoutingStrategy::Rules,
            },
        }
    }

    /// Full routing: rules, optional model, ensemble vote, product adjustments.
    pub async fn route(&self, request: &EnrichmentRequest) -> RoutingDecision {
        let rules = self.route_rules(request);

        let needs_model = self.ensemble || rules.confidence < self.config.rule_confidence_threshold;
        let mut decision = match (&self.gateway, needs_model) {
            (Some(gateway), true) => match self.route_with_model(request, gateway).await {
                Ok(model) => self.combine(rules, model),
                Err(e) => {
                    tracing::warn!(error = %e, "Model routing failed, using rule decision");
                    rules
                }
            },
            _ => rules,
        };

        self.cap(&mut decision);
        if request.is_product_enrichment() {
            self.force_official(&mut decision);
        }

        tracing::info!(
            intent = ?decision.intent_class,
            strategy = ?decision.strategy,
            confidence = decision.confidence,
            primary = ?decision.primary_sources,
            secondary = ?decision.secondary_sources,
            skip = decision.skip,
            "Routing decision"
        );
        decision
    }

    async fn route_with_model(
        &self,
        request: &EnrichmentRequest,
        gateway: &CallGateway,
    ) -> Result<RoutingDecision> {
        let prompt = build_router_prompt(request);
        let completion = gateway
            .call(&CompletionRequest::new(prompt, gateway.max_tokens()).with_system(ROUTER_SYSTEM_PROMPT))
            .await
            .context("Model router call failed")?;
        parse_router_response(&completion.text)
    }

    /// Ensemble vote between the rule and model decisions.
    fn combine(&self, rules: RoutingDecision, model: RoutingDecision) -> RoutingDecision {
        let margin = self.config.ensemble_margin + f32::EPSILON;
        if (rules.confidence - model.confidence).abs() <= margin {
            let lead = if model.confidence > rules.confidence {
                model.intent_class
            } else {
                rules.intent_class
            };
            let primary = interleave(&rules.primary_sources, &model.primary_sources);
            let secondary = interleave(&rules.secondary_sources, &model.secondary_sources);
            RoutingDecision {
                intent_class: lead,
                skip: primary.is_empty(),
                primary_sources: primary,
                secondary_sources: secondary,
                confidence: (rules.confidence + model.confidence) / 2.0,
                rationale: format!("ensemble: [{}] + [{}]", rules.rationale, model.rationale),
                strategy: RoutingStrategy::Ensemble,
            }
        } else if model.confidence > rules.confidence {
            model
        } else {
            rules
        }
    }

    fn cap(&self, decision: &mut RoutingDecision) {
        decision.primary_sources.truncate(self.config.max_primary_sources);
        let primary = decision.primary_sources.clone();
        decision.secondary_sources.retain(|s| !primary.contains(s));
        decision.secondary_sources.truncate(self.config.max_secondary_sources);
    }

    /// Official specs always lead for product requests; the last primary entry
    /// is dropped if the cap would be exceeded.
    fn force_official(&self, decision: &mut RoutingDecision) {
        decision.primary_sources.retain(|s| *s != OfficialSpecs);
        decision.secondary_sources.retain(|s| *s != OfficialSpecs);
        decision.primary_sources.insert(0, OfficialSpecs);
        decision.primary_sources.truncate(self.config.max_primary_sources);
        decision.skip = false;
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

/// Alternate entries from both lists (first list leads), dropping duplicates.
fn interleave(first: &[SourceCategory], second: &[SourceCategory]) -> Vec<SourceCategory> {
    let mut merged = Vec::with_capacity(first.len() + second.len());
    for i in 0..first.len().max(second.len()) {
        for list in [first, second] {
            if let Some(source) = list.get(i) {
                if !merged.contains(source) {
                    merged.push(*source);
                }
            }
        }
    }
    merged
}

// ============================================================================
// Model path
// ============================================================================

const ROUTER_SYSTEM_PROMPT: &str = r#"You route product enrichment requests to knowledge sources. Output ONLY a JSON object:

{"intent":"specifications|pricing|how_to|review|comparison|worth_buying|conceptual|general","primary_sources":["..."],"secondary_sources":["..."],"confidence":0.0,"rationale":"..."}

Sources: official_specs, manuals, comparison_sites, retailer_data, user_reviews, forum, video.
- conceptual: a generic question answerable without looking anything up; use empty source lists.
- confidence: your certainty in [0,1].
- rationale: one sentence."#;

fn build_router_prompt(request: &EnrichmentRequest) -> String {
    format!(
        "{}\nRequest: \"{}\"\nJSON:",
        request.product_context(),
        request.intent
    )
}

#[derive(Debug, Deserialize)]
struct ModelRouting {
    intent: String,
    #[serde(default)]
    primary_sources: Vec<String>,
    #[serde(default)]
    secondary_sources: Vec<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    rationale: String,
}

fn parse_sources(labels: &[String]) -> Vec<SourceCategory> {
    let mut sources = Vec::new();
    for label in labels {
        if let Some(source) = SourceCategory::from_label(label) {
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
    }
    sources
}

/// Parse model output, strict first, then field by field.
fn parse_router_response(raw: &str) -> Result<RoutingDecision> {
    let reply = ModelReply::parse(raw);
    let parsed = match reply.decode::<ModelRouting>() {
        Some(parsed) => parsed,
        None => ModelRouting {
            intent: reply.string("intent").context("Router output has no intent")?,
            primary_sources: reply.strings("primary_sources").unwrap_or_default(),
            secondary_sources: reply.strings("secondary_sources").unwrap_or_default(),
            confidence: reply.number("confidence").map(|c| c as f32),
            rationale: reply
                .string("rationale")
                .unwrap_or_else(|| "model router (partial parse)".to_string()),
        },
    };

    let intent_class = IntentClass::from_label(&parsed.intent)
        .with_context(|| format!("Unknown intent label '{}'", parsed.intent))?;
    let primary_sources = parse_sources(&parsed.primary_sources);
    let secondary_sources = parse_sources(&parsed.secondary_sources);

    Ok(RoutingDecision {
        intent_class,
        skip: primary_sources.is_empty(),
        primary_sources,
        secondary_sources,
        confidence: parsed.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        rationale: parsed.rationale,
        strategy: RoutingStrategy::Model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::llm::{ClassificationService, Completion, RetryPolicy};
    use crate::types::SourceCategory::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedService {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClassificationService for FixedService {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(text) => Ok(Completion {
                    text: text.clone(),
                    ..Default::default()
                }),
                None => Err(GatewayError::Network("down".into())),
            }
        }
    }

    fn router_with(reply: Option<&str>) -> (Router, Arc<FixedService>) {
        let service = Arc::new(FixedService {
            reply: reply.map(str::to_string),
            calls: AtomicUsize::new(0),
        });
        let gateway = Arc::new(CallGateway::new(service.clone(), 1000, RetryPolicy::default()));
        (Router::default().with_gateway(gateway), service)
    }

    fn intent_only(intent: &str) -> EnrichmentRequest {
        EnrichmentRequest::new("", "", "", "", intent)
    }

    #[test]
    fn test_rule_table_classification() {
        let router = Router::default();
        assert_eq!(router.route_rules(&intent_only("specs")).intent_class, IntentClass::Specifications);
        assert_eq!(router.route_rules(&intent_only("quanto costa?")).intent_class, IntentClass::Pricing);
        assert_eq!(
            router.route_rules(&intent_only("vale la pena comprarlo?")).intent_class,
            IntentClass::WorthBuying
        );
        assert_eq!(router.route_rules(&intent_only("DHP486 vs DHP485")).intent_class, IntentClass::Comparison);

        let concept = router.route_rules(&intent_only("Cos'è un motore brushless?"));
        assert_eq!(concept.intent_class, IntentClass::Conceptual);
        assert!(concept.skip);

        let general = router.route_rules(&intent_only("descrizione"));
        assert_eq!(general.intent_class, IntentClass::General);
        assert!((general.confidence - GENERAL_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[test]
    fn test_single_words_need_whole_token() {
        let router = Router::default();
        // "vs" must not fire inside another word
        let decision = router.route_rules(&intent_only("canvas"));
        assert_eq!(decision.intent_class, IntentClass::General);
    }

    #[tokio::test]
    async fn test_confident_rules_never_call_model() {
        let (router, service) = router_with(Some(r#"{"intent":"review","confidence":0.99}"#));
        let decision = router.route(&intent_only("specifiche tecniche")).await;
        assert_eq!(decision.strategy, RoutingStrategy::Rules);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensemble_always_calls_model() {
        let (router, service) = router_with(Some(r#"{"intent":"review","confidence":0.99}"#));
        let router = router.with_ensemble(true);
        router.route(&intent_only("specifiche tecniche")).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_higher_model_confidence_wins() {
        let reply = r#"{"intent":"review","primary_sources":["user_reviews","forum"],"secondary_sources":[],"confidence":0.95,"rationale":"opinion request"}"#;
        let (router, service) = router_with(Some(reply));
        let decision = router.route(&intent_only("descrizione")).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(decision.intent_class, IntentClass::Review);
        assert_eq!(decision.strategy, RoutingStrategy::Model);
        assert_eq!(decision.primary_sources, vec![UserReviews, Forum]);
    }

    #[tokio::test]
    async fn test_close_confidences_merge() {
        let reply = r#"{"intent":"review","primary_sources":["user_reviews"],"confidence":0.65}"#;
        let (router, _) = router_with(Some(reply));
        let decision = router.route(&intent_only("descrizione")).await;
        assert_eq!(decision.strategy, RoutingStrategy::Ensemble);
        assert!((decision.confidence - 0.625).abs() < 1e-6);
        assert_eq!(decision.primary_sources, vec![OfficialSpecs, UserReviews, RetailerData]);
        assert!(!decision.secondary_sources.contains(&UserReviews));
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_to_rules() {
        let (router, service) = router_with(None);
        let decision = router.route(&intent_only("descrizione")).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(decision.strategy, RoutingStrategy::Rules);
        assert_eq!(decision.intent_class, IntentClass::General);
    }

    #[tokio::test]
    async fn test_unparsable_output_falls_back_to_rules() {
        let (router, _) = router_with(Some("I think this is about reviews"));
        let decision = router.route(&intent_only("descrizione")).await;
        assert_eq!(decision.strategy, RoutingStrategy::Rules);
    }

    #[tokio::test]
    async fn test_official_forced_first_for_products() {
        let router = Router::default();
        let request = EnrichmentRequest::new("Trapano", "BrandX", "", "avvitatore", "opinioni utenti");
        let decision = router.route(&request).await;
        assert_eq!(decision.primary_sources, vec![OfficialSpecs, UserReviews, Forum]);

        let worth = EnrichmentRequest::new("Trapano", "BrandX", "", "avvitatore", "vale la pena?");
        let decision = router.route(&worth).await;
        // already contains official: moved to front, not duplicated
        assert_eq!(decision.primary_sources, vec![OfficialSpecs, UserReviews, RetailerData]);
        assert!(!decision.secondary_sources.contains(&OfficialSpecs));
    }

    #[tokio::test]
    async fn test_forcing_truncates_to_cap() {
        let config = RouterConfig {
            max_primary_sources: 2,
            ..Default::default()
        };
        let router = Router::new(config);
        let request = EnrichmentRequest::new("Trapano", "BrandX", "", "", "come si usa");
        let decision = router.route(&request).await;
        assert_eq!(decision.primary_sources, vec![OfficialSpecs, Manuals]);
    }

    #[test]
    fn test_lenient_parse_recovers_fields() {
        let raw = "```json\n{\"intent\":\"pricing\",\"primary_sources\":[\"retailer\",\"blog\"],\"confidence\":0.8,";
        let decision = parse_router_response(raw).unwrap();
        assert_eq!(decision.intent_class, IntentClass::Pricing);
        assert_eq!(decision.primary_sources, vec![RetailerData]);
        assert!((decision.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_interleave_dedupes() {
        let merged = interleave(&[OfficialSpecs, Manuals], &[Manuals, Video, Forum]);
        assert_eq!(merged, vec![OfficialSpecs, Manuals, Video, Forum]);
    }
}
