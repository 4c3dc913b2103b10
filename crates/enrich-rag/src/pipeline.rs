//! Enrichment orchestrator.
//!
//! One request/response cycle:
//! detector (short-circuit) → router → granularity → fusion plan →
//! concurrent per-category retrieval (cache + search) → extraction →
//! fusion → provenance.
//!
//! Retrieval is pluggable through the injected [`SearchClient`]; live and mock
//! search share this single pipeline.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheIntent, SearchCache};
use crate::config::EnrichmentConfig;
use crate::graph::{ProvenanceSummary, ProvenanceTracker};
use crate::llm::{CallGateway, ClassificationService, MetricsSnapshot, OpenAiCompatibleService};
use crate::rag::extraction::FactExtractor;
use crate::rag::fusion_executor::{ConflictRecord, FusedFact, FusionExecutor, FusionResult};
use crate::rag::fusion_planner::{FusionPlan, FusionPlanner};
use crate::rag::granularity::{relevance_density, GranularityDecision, GranularityLevel, GranularityPlanner};
use crate::rag::retrieval_decision::{NoRetrievalDetector, RetrievalDecision, RetrievalStrategy};
use crate::rag::router::{IntentClass, Router, RoutingDecision, RoutingStrategy};
use crate::search::{SearchClient, SearchHit};
use crate::types::{EnrichmentRequest, RetrievedItem, SourceCategory};

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnrichmentData {
    Evidence {
        evidence: Vec<FusedFact>,
        coverage: f32,
        confidence: f32,
        conflicts: Vec<ConflictRecord>,
        /// Raw items kept within the token budget, for the generation step.
        snippets: Vec<RetrievedItem>,
    },
    Error {
        error: String,
    },
}

impl EnrichmentData {
    fn empty() -> Self {
        EnrichmentData::Evidence {
            evidence: Vec::new(),
            coverage: 0.0,
            confidence: 0.0,
            conflicts: Vec::new(),
            snippets: Vec::new(),
        }
    }
}

/// Counts from the fusion run; the facts themselves live in `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionOutcome {
    pub facts: usize,
    pub conflicts: usize,
    pub coverage_score: f32,
    pub confidence_score: f32,
    pub snippets: usize,
    pub tokens_used: usize,
}

impl From<&FusionResult> for FusionOutcome {
    fn from(result: &FusionResult) -> Self {
        Self {
            facts: result.combined_evidence.len(),
            conflicts: result.conflicts_detected.len(),
            coverage_score: result.coverage_score,
            confidence_score: result.confidence_score,
            snippets: result.snippets.len(),
            tokens_used: result.tokens_used,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub routing: Option<RoutingDecision>,
    pub granularity: Option<GranularityDecision>,
    pub retrieval: Option<RetrievalDecision>,
    pub fusion_plan: Option<FusionPlan>,
    pub fusion_result: Option<FusionOutcome>,
    pub sources_queried: Vec<SourceCategory>,
    /// Evidence tokens handed downstream plus classification-service tokens.
    pub tokens_used: usize,
    pub execution_time_ms: u64,
    pub cost_savings: f32,
    /// Gateway counter growth during this request.
    pub gateway: MetricsSnapshot,
    pub provenance: Option<ProvenanceSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResponse {
    pub success: bool,
    pub data: EnrichmentData,
    pub metadata: ResponseMetadata,
    pub debug_log: Vec<String>,
}

impl EnrichmentResponse {
    pub fn evidence(&self) -> &[FusedFact] {
        match &self.data {
            EnrichmentData::Evidence { evidence, .. } => evidence,
            EnrichmentData::Error { .. } => &[],
        }
    }

    pub fn fact(&self, key: &str) -> Option<&FusedFact> {
        self.evidence().iter().find(|f| f.key == key)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.data {
            EnrichmentData::Error { error } => Some(error),
            EnrichmentData::Evidence { .. } => None,
        }
    }
}

/// Per-request log returned to the caller, entries stamped with elapsed ms.
///
/// Step lines are kept only in verbose mode; warnings always are.
struct DebugLog {
    started: Instant,
    verbose: bool,
    entries: Vec<String>,
}

impl DebugLog {
    fn new(started: Instant, verbose: bool) -> Self {
        Self {
            started,
            verbose,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, message: impl AsRef<str>) {
        if self.verbose {
            let line = self.stamp(message.as_ref());
            tracing::debug!("{}", line);
            self.entries.push(line);
        }
    }

    fn warn(&mut self, message: impl AsRef<str>) {
        let line = self.stamp(message.as_ref());
        self.entries.push(line);
    }

    fn stamp(&self, message: &str) -> String {
        format!("[{}ms] {}", self.started.elapsed().as_millis(), message)
    }
}

/// Hits gathered for one source category.
struct CategoryRetrieval {
    category: SourceCategory,
    hits: Vec<SearchHit>,
    cached: bool,
    /// Answered by the fallback provider after every live one failed.
    fallback: bool,
    error: Option<String>,
}

impl CategoryRetrieval {
    fn failed(category: SourceCategory, error: String) -> Self {
        Self {
            category,
            hits: Vec::new(),
            cached: false,
            fallback: false,
            error: Some(error),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct EnrichmentPipeline {
    config: EnrichmentConfig,
    gateway: Option<Arc<CallGateway>>,
    cache: SearchCache,
    search: SearchClient,
    router: Router,
    granularity: GranularityPlanner,
    detector: NoRetrievalDetector,
    extractor: FactExtractor,
    planner: FusionPlanner,
    executor: FusionExecutor,
}

impl EnrichmentPipeline {
    /// Assemble from explicit search and cache instances, without a
    /// classification service. Attach one with [`with_gateway`](Self::with_gateway).
    pub fn new(config: EnrichmentConfig, search: SearchClient, cache: SearchCache) -> Self {
        let router = Router::new(config.router.clone()).with_ensemble(config.stages.ensemble);
        let granularity = GranularityPlanner::new(config.granularity.clone());
        let planner = FusionPlanner::new(config.fusion.clone(), config.limits.clone());
        let executor = FusionExecutor::new(config.fusion.clone());
        Self {
            config,
            gateway: None,
            cache,
            search,
            router,
            granularity,
            detector: NoRetrievalDetector::new(),
            extractor: FactExtractor::new(),
            planner,
            executor,
        }
    }

    /// Build every component from configuration: search backends from
    /// credentials, cache backend from the store path, and a gateway when a
    /// classification endpoint is configured.
    pub fn from_config(config: EnrichmentConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid enrichment config")?;

        crate::telemetry::init_logging(config.debug);

        let search = SearchClient::from_config(&config.search);
        let cache = SearchCache::from_config(&config.cache);

        let service = match OpenAiCompatibleService::from_config(&config.gateway) {
            Some(Ok(service)) => Some(Arc::new(service) as Arc<dyn ClassificationService>),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Classification service unavailable, rules only");
                None
            }
            None => None,
        };

        let pipeline = Self::new(config, search, cache);
        Ok(match service {
            Some(service) => {
                let gateway = Arc::new(CallGateway::from_config(service, &pipeline.config.gateway));
                pipeline.with_gateway(gateway)
            }
            None => pipeline,
        })
    }

    /// Route model-assisted stages through `gateway`, as enabled by the stage toggles.
    pub fn with_gateway(mut self, gateway: Arc<CallGateway>) -> Self {
        let stages = &self.config.stages;
        let mut router = Router::new(self.config.router.clone()).with_ensemble(stages.ensemble);
        if stages.model_routing {
            router = router.with_gateway(gateway.clone());
        }
        self.router = router;
        self.detector = if stages.model_detection {
            NoRetrievalDetector::new().with_gateway(gateway.clone())
        } else {
            NoRetrievalDetector::new()
        };
        self.extractor = if stages.model_extraction {
            FactExtractor::new().with_gateway(gateway.clone())
        } else {
            FactExtractor::new()
        };
        self.gateway = Some(gateway);
        self
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }

    pub fn gateway(&self) -> Option<&Arc<CallGateway>> {
        self.gateway.as_ref()
    }

    /// Field-oriented entry point matching the catalogue integration.
    pub async fn enrich_fields(
        &self,
        title: &str,
        vendor: &str,
        product_type: &str,
        sku: &str,
        enrichment_type: &str,
    ) -> EnrichmentResponse {
        let request = EnrichmentRequest::new(title, vendor, sku, product_type, enrichment_type);
        self.enrich(&request).await
    }

    /// Run one enrichment. Never fails: errors become `success = false`.
    pub async fn enrich(&self, request: &EnrichmentRequest) -> EnrichmentResponse {
        let started = Instant::now();
        let mut log = DebugLog::new(started, self.config.debug);
        let mut metadata = ResponseMetadata::default();
        let metrics_before = self.metrics_snapshot();

        log.push(format!(
            "request: title='{}' vendor='{}' intent='{}'",
            request.title, request.vendor, request.intent
        ));

        let outcome = self.run(request, &mut metadata, &mut log).await;

        metadata.gateway = self.metrics_snapshot().since(&metrics_before);
        metadata.tokens_used += metadata.gateway.total_tokens() as usize;
        metadata.execution_time_ms = started.elapsed().as_millis() as u64;

        let (success, data) = match outcome {
            Ok(data) => (true, data),
            Err(e) => {
                tracing::error!(error = %e, "Enrichment failed");
                log.warn(format!("error: {:#}", e));
                (false, EnrichmentData::Error { error: format!("{:#}", e) })
            }
        };

        tracing::info!(
            success,
            sources = ?metadata.sources_queried,
            tokens = metadata.tokens_used,
            elapsed_ms = metadata.execution_time_ms,
            "Enrichment complete"
        );

        EnrichmentResponse {
            success,
            data,
            metadata,
            debug_log: log.entries,
        }
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.gateway
            .as_ref()
            .map(|g| g.metrics().snapshot())
            .unwrap_or_default()
    }

    async fn run(
        &self,
        request: &EnrichmentRequest,
        metadata: &mut ResponseMetadata,
        log: &mut DebugLog,
    ) -> Result<EnrichmentData> {
        if request.title.trim().is_empty() && request.intent.trim().is_empty() {
            bail!("request has neither a title nor an intent");
        }
        let stages = &self.config.stages;

        // 1. Is retrieval needed at all?
        let mut limits = self.config.limits.clone();
        if stages.no_retrieval_detection {
            let retrieval = self.detector.detect(request).await;
            log.push(format!(
                "retrieval: {:?} ({:?}) {}",
                retrieval.necessity, retrieval.knowledge_class, retrieval.rationale
            ));
            metadata.cost_savings = retrieval.estimated_savings;
            let strategy = retrieval.strategy;
            metadata.retrieval = Some(retrieval);
            match strategy {
                RetrievalStrategy::Parametric => {
                    log.push("short-circuit: background knowledge is sufficient");
                    return Ok(EnrichmentData::empty());
                }
                RetrievalStrategy::Light { max_sources } => {
                    limits.max_sources = limits.max_sources.min(max_sources);
                }
                RetrievalStrategy::Full => {}
            }
        }

        // 2. Which sources?
        let routing = if stages.routing {
            self.router.route(request).await
        } else {
            all_sources_routing()
        };
        log.push(format!(
            "routing: {:?} confidence {:.2} primary {:?} secondary {:?}",
            routing.intent_class, routing.confidence, routing.primary_sources, routing.secondary_sources
        ));
        let skip = routing.skip;
        metadata.routing = Some(routing.clone());
        if skip {
            log.push("short-circuit: no source worth consulting");
            return Ok(EnrichmentData::empty());
        }

        // 3. How much context?
        let granularity = if stages.granularity {
            self.granularity.plan(&request.intent)
        } else {
            GranularityDecision::at(GranularityLevel::Paragraph, "granularity planning disabled")
        };
        log.push(format!(
            "granularity: {:?} ({} tokens, {} chunks)",
            granularity.level, granularity.token_budget, granularity.chunk_budget
        ));

        // 4. Plan
        let plan = self
            .planner
            .plan_with_limits(&request.intent, &routing, &granularity, &limits);
        for constraint in &plan.unsatisfied_constraints {
            log.warn(format!("plan constraint unsatisfied: {}", constraint));
        }
        let sources = plan.sources();
        log.push(format!("plan: {:?} over {:?}", plan.strategy, sources));
        metadata.sources_queried = sources.clone();
        metadata.fusion_plan = Some(plan.clone());

        // 5. Retrieve, one task per category
        let retrievals = join_all(sources.iter().map(|&category| self.retrieve_isolated(request, category))).await;
        let fallback_factor = self.config.search.fallback_reliability_factor;
        let mut items = Vec::new();
        for retrieval in retrievals {
            match &retrieval.error {
                Some(error) => log.warn(format!("{}: retrieval failed: {}", retrieval.category, error)),
                None if retrieval.fallback => log.warn(format!(
                    "{}: {} hits from fallback search (not cached)",
                    retrieval.category,
                    retrieval.hits.len()
                )),
                None => log.push(format!(
                    "{}: {} hits{}",
                    retrieval.category,
                    retrieval.hits.len(),
                    if retrieval.cached { " (cached)" } else { "" }
                )),
            }
            let category = retrieval.category;
            let reliability = if retrieval.fallback {
                category.default_reliability() * fallback_factor
            } else {
                category.default_reliability()
            };
            items.extend(
                retrieval
                    .hits
                    .iter()
                    .map(|hit| {
                        RetrievedItem::new(category, hit.to_evidence(), hit.provider.clone())
                            .with_reliability(reliability)
                    })
                    .filter(|item| !item.evidence.is_empty()),
            );
        }

        // 6. Adapt the context budget to what came back
        let granularity = if stages.granularity {
            let texts: Vec<String> = items.iter().map(|item| item.evidence.text()).collect();
            let query = format!("{} {}", request.title, request.intent);
            match relevance_density(&query, &texts) {
                Some(density) => {
                    let adapted = self.granularity.adapt(&granularity, density);
                    log.push(format!("relevance density {:.2}: {:?}", density, adapted.level));
                    adapted
                }
                None => granularity,
            }
        } else {
            granularity
        };
        let token_budget = granularity.token_budget.min(limits.token_budget);
        metadata.granularity = Some(granularity);

        // 7. Fuse
        let facts = if stages.fusion {
            self.extractor.extract(&items).await
        } else {
            Vec::new()
        };
        let result = self.executor.execute(&plan, &items, &facts, token_budget);
        log.push(format!(
            "fusion: {} facts, {} conflicts, coverage {:.2}, confidence {:.1}",
            result.combined_evidence.len(),
            result.conflicts_detected.len(),
            result.coverage_score,
            result.confidence_score
        ));
        metadata.tokens_used = result.tokens_used;
        metadata.fusion_result = Some(FusionOutcome::from(&result));

        // 8. Lineage
        if stages.provenance {
            let summary = self.record_provenance(&result.combined_evidence);
            if !summary.low_provenance.is_empty() {
                log.warn(format!("low provenance: {:?}", summary.low_provenance));
            }
            metadata.provenance = Some(summary);
        }

        Ok(EnrichmentData::Evidence {
            evidence: result.combined_evidence,
            coverage: result.coverage_score,
            confidence: result.confidence_score,
            conflicts: result.conflicts_detected,
            snippets: result.snippets,
        })
    }

    /// [`retrieve`](Self::retrieve) with panics from a provider contained to
    /// its category.
    async fn retrieve_isolated(&self, request: &EnrichmentRequest, category: SourceCategory) -> CategoryRetrieval {
        match AssertUnwindSafe(self.retrieve(request, category)).catch_unwind().await {
            Ok(retrieval) => retrieval,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(category = %category, panic = %message, "Retrieval panicked");
                CategoryRetrieval::failed(category, format!("panicked: {}", message))
            }
        }
    }

    /// Cache lookup, then search on a miss. Failures yield no hits.
    /// Fallback results are returned but never cached.
    async fn retrieve(&self, request: &EnrichmentRequest, category: SourceCategory) -> CategoryRetrieval {
        let query = format!("{} {}", request.search_terms(), category.query_suffix())
            .trim()
            .to_string();
        let domains = category.domain_filter(&request.vendor);

        if let Some(hits) = self.cache.lookup(&query, &domains).await {
            return CategoryRetrieval {
                category,
                hits,
                cached: true,
                fallback: false,
                error: None,
            };
        }

        match self.search.search(&query, &domains).await {
            Ok(outcome) => {
                if outcome.fallback {
                    tracing::info!(category = %category, provider = %outcome.provider, "Fallback results, skipping cache");
                } else {
                    let ttl = self.cache.ttl_for(CacheIntent::for_source(category));
                    self.cache.store(&query, &domains, outcome.hits.clone(), ttl).await;
                }
                CategoryRetrieval {
                    category,
                    hits: outcome.hits,
                    cached: false,
                    fallback: outcome.fallback,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(category = %category, error = %e, "Retrieval failed");
                CategoryRetrieval::failed(category, e.to_string())
            }
        }
    }

    fn record_provenance(&self, facts: &[FusedFact]) -> ProvenanceSummary {
        let mut tracker = ProvenanceTracker::new();
        for fact in facts {
            let fusion_id = tracker.record_fused_fact(fact);
            if fact.needs_verification {
                tracker.record_verification(&fusion_id, false, &fact.resolution_note);
            }
        }
        tracing::debug!(
            request_id = %tracker.request_id(),
            nodes = tracker.node_count(),
            edges = tracker.edge_count(),
            "Provenance recorded"
        );
        tracker.summary(self.config.fusion.low_provenance_threshold)
    }
}

/// Routing used when the router stage is disabled: every category is a candidate.
fn all_sources_routing() -> RoutingDecision {
    RoutingDecision {
        intent_class: IntentClass::General,
        primary_sources: SourceCategory::ALL.to_vec(),
        secondary_sources: Vec::new(),
        confidence: 0.0,
        rationale: "routing disabled".to_string(),
        skip: false,
        strategy: RoutingStrategy::Rules,
    }
}
