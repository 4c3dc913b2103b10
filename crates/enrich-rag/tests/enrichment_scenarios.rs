//! End-to-end enrichment runs against scripted search and classification services.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use enrich_rag::config::EnrichmentConfig;
use enrich_rag::graph::ProvenanceKind;
use enrich_rag::llm::RetryPolicy;
use enrich_rag::rag::{FusionStrategy, GranularityLevel, RetrievalNecessity, RetrievalStrategy};
use enrich_rag::{
    CallGateway, ClassificationService, Completion, CompletionRequest, EnrichmentPipeline, EnrichmentRequest,
    GatewayError, SearchCache, SearchClient, SearchError, SearchHit, SearchProvider, SourceCategory,
};

/// Hits keyed by the first domain of the filter.
struct CatalogSearch {
    calls: AtomicU64,
}

impl CatalogSearch {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SearchProvider for CatalogSearch {
    fn name(&self) -> &str {
        "catalog"
    }

    async fn search(
        &self,
        _query: &str,
        domain_filter: &[String],
        _max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hits = match domain_filter.first().map(String::as_str) {
            Some("brandx.com") => vec![SearchHit::snippet(
                "Trapano avvitatore 18V - scheda tecnica",
                "https://brandx.com/trapano-18v",
                "Coppia massima 135 Nm",
                "catalog",
            )],
            Some("amazon.it") => vec![SearchHit::snippet(
                "Trapano avvitatore BrandX",
                "https://amazon.it/dp/brandx-18v",
                "",
                "catalog",
            )
            .with_attribute("Coppia", "110 Nm")],
            Some("manualslib.com") => Vec::new(),
            _ => {
                return Err(SearchError::Provider {
                    provider: "catalog".into(),
                    message: "unexpected domain".into(),
                })
            }
        };
        Ok(hits)
    }
}

/// Fixed hits per first domain; unlisted domains fail.
struct TableSearch {
    table: Vec<(&'static str, Vec<SearchHit>)>,
}

#[async_trait]
impl SearchProvider for TableSearch {
    fn name(&self) -> &str {
        "table"
    }

    async fn search(
        &self,
        _query: &str,
        domain_filter: &[String],
        _max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let first = domain_filter.first().map(String::as_str);
        self.table
            .iter()
            .find(|(domain, _)| Some(*domain) == first)
            .map(|(_, hits)| hits.clone())
            .ok_or_else(|| SearchError::Provider {
                provider: "table".into(),
                message: "unlisted domain".into(),
            })
    }
}

/// Panics on retailer lookups, answers the rest like [`CatalogSearch`].
struct PanickingSearch {
    inner: CatalogSearch,
}

#[async_trait]
impl SearchProvider for PanickingSearch {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn search(
        &self,
        query: &str,
        domain_filter: &[String],
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if domain_filter.first().map(String::as_str) == Some("amazon.it") {
            panic!("listing parser blew up");
        }
        self.inner.search(query, domain_filter, max_results).await
    }
}

fn official_torque(value: &str) -> SearchHit {
    SearchHit::snippet(
        "Trapano avvitatore - scheda tecnica",
        "https://brandx.com/trapano-18v",
        format!("Coppia massima {}", value),
        "table",
    )
}

fn table_pipeline(table: Vec<(&'static str, Vec<SearchHit>)>) -> EnrichmentPipeline {
    let client = SearchClient::new(vec![Arc::new(TableSearch { table }) as Arc<dyn SearchProvider>], 5);
    EnrichmentPipeline::new(EnrichmentConfig::default(), client, SearchCache::in_memory(100))
}

/// Counts calls and answers every prompt with the same text.
struct CountingService {
    reply: String,
    calls: AtomicU64,
}

impl CountingService {
    fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ClassificationService for CountingService {
    fn name(&self) -> &str {
        "counting"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: self.reply.clone(),
            prompt_tokens: 20,
            completion_tokens: 10,
        })
    }
}

fn drill_request() -> EnrichmentRequest {
    EnrichmentRequest::new("Trapano avvitatore 18V", "BrandX", "", "avvitatore", "specs")
}

fn pipeline_with(search: Arc<CatalogSearch>) -> EnrichmentPipeline {
    let client = SearchClient::new(vec![search as Arc<dyn SearchProvider>], 5);
    EnrichmentPipeline::new(EnrichmentConfig::default(), client, SearchCache::in_memory(100))
}

fn gateway_for(service: Arc<CountingService>) -> Arc<CallGateway> {
    Arc::new(CallGateway::new(service, 600, RetryPolicy::default()))
}

#[tokio::test]
async fn test_official_torque_wins_conflict() {
    let pipeline = pipeline_with(Arc::new(CatalogSearch::new()));
    let response = pipeline.enrich(&drill_request()).await;

    assert!(response.success, "{:?}", response.error());
    let necessity = response.metadata.retrieval.as_ref().map(|r| r.necessity);
    assert_eq!(necessity, Some(RetrievalNecessity::Required));
    assert!(response
        .metadata
        .sources_queried
        .contains(&SourceCategory::RetailerData));

    let torque = response.fact("torque").expect("torque fused");
    assert_eq!(torque.value, "135 Nm");
    assert!(torque.conflicting);
    assert!(torque.needs_verification);
    assert_eq!(torque.contributors.len(), 2);
    assert!(torque.alternatives.iter().any(|a| a.value == "110 Nm"));

    let enrich_rag::EnrichmentData::Evidence { conflicts, .. } = &response.data else {
        panic!("expected evidence");
    };
    let conflict = conflicts.iter().find(|c| c.key == "torque").expect("conflict recorded");
    assert_eq!(conflict.resolved_by, SourceCategory::OfficialSpecs);
    assert!(conflict.relative_difference.unwrap() > 0.2);

    let provenance = response.metadata.provenance.as_ref().expect("provenance recorded");
    assert!(provenance.nodes.iter().any(|n| n.url.as_deref() == Some("https://brandx.com/trapano-18v")));
}

#[tokio::test]
async fn test_concept_question_skips_retrieval() {
    let search = Arc::new(CatalogSearch::new());
    let pipeline = pipeline_with(search.clone());
    let response = pipeline
        .enrich(&EnrichmentRequest::new("", "", "", "", "Cos'è un motore brushless?"))
        .await;

    assert!(response.success);
    let retrieval = response.metadata.retrieval.as_ref().expect("retrieval decision");
    assert_eq!(retrieval.necessity, RetrievalNecessity::Unnecessary);
    assert_eq!(retrieval.strategy, RetrievalStrategy::Parametric);
    assert!(response.metadata.sources_queried.is_empty());
    assert!(response.metadata.fusion_plan.is_none());
    assert_eq!(search.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_confident_rules_make_no_service_calls() {
    let service = Arc::new(CountingService::new(
        r#"{"intent":"review","primary_sources":["forum"],"secondary_sources":[],"confidence":0.99,"rationale":"x"}"#,
    ));
    let pipeline = pipeline_with(Arc::new(CatalogSearch::new())).with_gateway(gateway_for(service.clone()));

    let response = pipeline.enrich(&drill_request()).await;
    assert!(response.success);
    assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    assert_eq!(response.metadata.gateway.calls, 0);
}

#[tokio::test]
async fn test_model_number_always_retrieves() {
    // the service insists nothing needs retrieving
    let service = Arc::new(CountingService::new(
        r#"{"necessity":"unnecessary","knowledge_class":"domain_concept","rationale":"generic"}"#,
    ));
    let pipeline = pipeline_with(Arc::new(CatalogSearch::new())).with_gateway(gateway_for(service));

    let response = pipeline
        .enrich_fields("Avvitatore", "BrandX", "avvitatore", "", "descrizione breve per DHP486Z")
        .await;
    assert!(response.success);
    let retrieval = response.metadata.retrieval.as_ref().expect("retrieval decision");
    assert_eq!(retrieval.necessity, RetrievalNecessity::Required);
    assert!(!retrieval.model_override);
    assert!(!response.metadata.sources_queried.is_empty());
}

#[tokio::test]
async fn test_uncertain_routing_reports_gateway_usage() {
    let service = Arc::new(CountingService::new("not json at all"));
    let pipeline = pipeline_with(Arc::new(CatalogSearch::new())).with_gateway(gateway_for(service.clone()));

    // no rule keyword: router asks the model, gets garbage, keeps its rules
    let response = pipeline
        .enrich_fields("Trapano avvitatore 18V", "BrandX", "avvitatore", "", "testo per la vetrina")
        .await;
    assert!(response.success);
    assert!(service.calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(response.metadata.gateway.calls, service.calls.load(Ordering::SeqCst));
    assert!(response.metadata.tokens_used >= 30);
    let routing = response.metadata.routing.as_ref().expect("routing decision");
    assert_eq!(routing.primary_sources.first(), Some(&SourceCategory::OfficialSpecs));
}

#[tokio::test]
async fn test_failed_category_does_not_abort_request() {
    let search = Arc::new(CatalogSearch::new());
    let pipeline = pipeline_with(search);
    // reviews hit an unknown domain and fail; the rest still fuse
    let response = pipeline
        .enrich_fields("Trapano avvitatore 18V", "BrandX", "avvitatore", "", "vale la pena?")
        .await;
    assert!(response.success);
    assert!(response
        .debug_log
        .iter()
        .any(|line| line.contains("retrieval failed")));
}

#[tokio::test]
async fn test_close_values_agree_on_most_reliable_source() {
    // 135 vs 132 Nm is 2.3 % apart, inside the agreement tolerance
    let pipeline = table_pipeline(vec![
        ("brandx.com", vec![official_torque("135 Nm")]),
        (
            "amazon.it",
            vec![SearchHit::snippet("Trapano BrandX", "https://amazon.it/dp/x", "", "table")
                .with_attribute("Coppia", "132 Nm")],
        ),
    ]);
    let response = pipeline.enrich(&drill_request()).await;
    assert!(response.success, "{:?}", response.error());

    let torque = response.fact("torque").expect("torque fused");
    assert!(!torque.conflicting);
    assert_eq!(torque.value, "135 Nm");
    assert_eq!(torque.agreeing_sources, 2);
    assert!(torque.confirmed);
    assert!(!torque.needs_verification);
    let enrich_rag::EnrichmentData::Evidence { conflicts, .. } = &response.data else {
        panic!("expected evidence");
    };
    assert!(conflicts.iter().all(|c| c.key != "torque"));
}

#[tokio::test]
async fn test_single_source_triangulation_needs_verification() {
    let pipeline = table_pipeline(vec![
        ("brandx.com", vec![official_torque("135 Nm")]),
        (
            "amazon.it",
            vec![SearchHit::snippet("Trapano BrandX", "https://amazon.it/dp/x", "", "table").with_price("129,90 €")],
        ),
    ]);
    let response = pipeline.enrich(&drill_request()).await;
    assert!(response.success);

    let plan = response.metadata.fusion_plan.as_ref().expect("fusion plan");
    assert_eq!(plan.strategy, FusionStrategy::Triangulation);
    assert_eq!(plan.min_agreement, 2);

    let torque = response.fact("torque").expect("torque fused");
    assert_eq!(torque.value, "135 Nm");
    assert_eq!(torque.agreeing_sources, 1);
    assert!(!torque.confirmed);
    assert!(torque.needs_verification);

    let provenance = response.metadata.provenance.as_ref().expect("provenance recorded");
    assert!(provenance.counts.get(&ProvenanceKind::Verification).copied().unwrap_or(0) >= 1);
}

#[tokio::test]
async fn test_sparse_hits_promote_granularity() {
    let unrelated = || {
        vec![SearchHit::snippet(
            "Offerte giardinaggio",
            "https://example.test/giardino",
            "Tagliaerba e decespugliatori in promozione",
            "table",
        )]
    };
    let pipeline = table_pipeline(vec![("brandx.com", unrelated()), ("amazon.it", unrelated())]);
    let response = pipeline.enrich(&drill_request()).await;
    assert!(response.success);

    // "specs" plans at sentence level; nothing relevant came back
    let granularity = response.metadata.granularity.as_ref().expect("granularity");
    let density = granularity.relevance_density.expect("density measured");
    assert!(density < 0.3, "{}", density);
    assert_eq!(granularity.level, GranularityLevel::Paragraph);
    assert_eq!(granularity.token_budget, GranularityLevel::Paragraph.token_ceiling());
}

#[tokio::test]
async fn test_dense_hits_demote_granularity() {
    let on_topic = || {
        vec![SearchHit::snippet(
            "Trapano avvitatore 18V",
            "https://brandx.com/trapano-18v",
            "Tutte le specs del trapano avvitatore 18V",
            "table",
        )]
    };
    let pipeline = table_pipeline(vec![("brandx.com", on_topic()), ("amazon.it", on_topic())]);
    let response = pipeline.enrich(&drill_request()).await;

    let granularity = response.metadata.granularity.as_ref().expect("granularity");
    assert!(granularity.relevance_density.expect("density measured") > 0.8);
    assert_eq!(granularity.level, GranularityLevel::Fact);
}

#[tokio::test]
async fn test_panicking_provider_fails_only_its_category() {
    let search = PanickingSearch {
        inner: CatalogSearch::new(),
    };
    let client = SearchClient::new(vec![Arc::new(search) as Arc<dyn SearchProvider>], 5);
    let pipeline = EnrichmentPipeline::new(EnrichmentConfig::default(), client, SearchCache::in_memory(100));

    let response = pipeline.enrich(&drill_request()).await;
    assert!(response.success, "{:?}", response.error());
    assert!(response
        .debug_log
        .iter()
        .any(|line| line.contains("retrieval failed: panicked: listing parser blew up")));

    // the official figure still arrives, now without a retailer to contradict it
    let torque = response.fact("torque").expect("torque fused");
    assert_eq!(torque.value, "135 Nm");
    assert!(!torque.conflicting);
}
