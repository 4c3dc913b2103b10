//! Shared-resource behaviour: the call gateway window and the persistent result cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use enrich_rag::cache::{SearchCache, SqliteBackend};
use enrich_rag::config::{CacheConfig, EnrichmentConfig, TtlConfig};
use enrich_rag::llm::RetryPolicy;
use enrich_rag::search::MockSearch;
use enrich_rag::{
    CacheIntent, CallGateway, ClassificationService, Completion, CompletionRequest, EnrichmentPipeline,
    EnrichmentRequest, GatewayError, SearchClient, SearchError, SearchHit, SearchProvider,
};

fn verbose() -> EnrichmentConfig {
    EnrichmentConfig {
        debug: true,
        ..EnrichmentConfig::default()
    }
}

/// Every lookup fails, as with revoked credentials.
struct RejectingSearch;

#[async_trait]
impl SearchProvider for RejectingSearch {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn search(&self, _query: &str, _domains: &[String], _max: usize) -> Result<Vec<SearchHit>, SearchError> {
        Err(SearchError::Status {
            provider: "rejecting".into(),
            status_code: 401,
        })
    }
}

struct EchoService {
    calls: AtomicU64,
}

#[async_trait]
impl ClassificationService for EchoService {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: request.prompt.clone(),
            prompt_tokens: 1,
            completion_tokens: 1,
        })
    }
}

#[tokio::test]
async fn test_window_overflow_waits_for_refill() {
    let service = Arc::new(EchoService {
        calls: AtomicU64::new(0),
    });
    let gateway = Arc::new(CallGateway::with_window(
        service.clone(),
        4,
        Duration::from_millis(800),
        RetryPolicy::default(),
    ));

    let start = Instant::now();
    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .call(&CompletionRequest::new(format!("prompt {}", i), 10))
                    .await
                    .map(|_| start.elapsed())
            })
        })
        .collect();

    let mut finished = Vec::new();
    for task in tasks {
        finished.push(task.await.unwrap().unwrap());
    }
    finished.sort();

    // four fit the burst, the fifth waits one refill interval (200 ms)
    assert!(finished[3] < Duration::from_millis(150), "{:?}", finished);
    assert!(finished[4] >= Duration::from_millis(150), "{:?}", finished);
    assert_eq!(service.calls.load(Ordering::SeqCst), 5);
    assert_eq!(gateway.metrics().snapshot().calls, 5);
    assert_eq!(gateway.metrics().snapshot().total_tokens(), 10);
}

#[test]
fn test_cache_entry_expires_after_ttl() {
    let cache = SearchCache::in_memory(10);
    let domains = vec!["b.com".to_string(), "a.com".to_string()];
    let hits = vec![SearchHit::snippet("t", "https://a.com/1", "text", "mock")];

    cache.set_with_ttl("Trapano 18V", &domains, &hits, Duration::from_millis(50));
    let reordered = vec!["a.com".to_string(), "b.com".to_string()];
    let cached = cache.get("trapano 18v", &reordered).expect("hit within ttl");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].url, "https://a.com/1");

    std::thread::sleep(Duration::from_millis(120));
    assert!(cache.get("Trapano 18V", &domains).is_none());
}

#[tokio::test]
async fn test_results_persist_across_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("search_cache.db");
    let request = EnrichmentRequest::new("Trapano avvitatore 18V", "BrandX", "", "avvitatore", "specs");

    let build = || {
        let backend = Arc::new(SqliteBackend::open(&path).unwrap());
        let cache = SearchCache::new(backend, TtlConfig::default());
        let search = SearchClient::new(vec![Arc::new(MockSearch)], 3);
        EnrichmentPipeline::new(verbose(), search, cache)
    };

    let first = build().enrich(&request).await;
    assert!(first.success);
    assert!(first.debug_log.iter().all(|line| !line.contains("(cached)")));

    let second_pipeline = build();
    let second = second_pipeline.enrich(&request).await;
    assert!(second.success);
    assert_eq!(second.metadata.sources_queried, first.metadata.sources_queried);
    assert!(second.debug_log.iter().any(|line| line.contains("(cached)")));
    assert_eq!(second_pipeline.cache().stats().writes, 0);
}

#[test]
fn test_configured_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        store_path: Some(dir.path().join("cache.db")),
        ..CacheConfig::default()
    };
    let hits = vec![SearchHit::snippet("Manuale", "https://manualslib.com/x", "istruzioni", "mock")];

    SearchCache::from_config(&config).set("manuale trapano", &[], &hits, CacheIntent::Manual);
    let reopened = SearchCache::from_config(&config);
    assert_eq!(reopened.backend_name(), "sqlite");
    assert_eq!(reopened.get("manuale trapano", &[]).unwrap(), hits);
}

#[tokio::test]
async fn test_fallback_results_never_reach_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("search_cache.db");
    let request = EnrichmentRequest::new("Trapano avvitatore 18V", "BrandX", "", "avvitatore", "specs");

    let build = || {
        let backend = Arc::new(SqliteBackend::open(&path).unwrap());
        let cache = SearchCache::new(backend, TtlConfig::default());
        let search = SearchClient::new(vec![Arc::new(RejectingSearch)], 3).with_fallback(Arc::new(MockSearch));
        EnrichmentPipeline::new(verbose(), search, cache)
    };

    let first_pipeline = build();
    let first = first_pipeline.enrich(&request).await;
    assert!(first.success);
    assert!(!first.metadata.sources_queried.is_empty());
    assert_eq!(first_pipeline.cache().stats().writes, 0);

    // a second process sharing the store finds no mock entries
    let second_pipeline = build();
    let second = second_pipeline.enrich(&request).await;
    assert!(second.debug_log.iter().all(|line| !line.contains("(cached)")));
    assert_eq!(second_pipeline.cache().stats().hits, 0);
    assert!(second_pipeline.cache().is_empty());
}
