//! Search result cache.
//!
//! Content-addressed: the key is a SHA-256 of the normalised query plus the
//! sorted domain filter, so `key(q, [a, b]) == key(q, [b, a])`. Entries carry a
//! TTL chosen by volatility class. Every backend error degrades to a miss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{CacheConfig, TtlConfig};
use crate::error::CacheError;
use crate::search::SearchHit;
use crate::types::SourceCategory;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Volatility class deciding how long cached results stay fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheIntent {
    Manual,
    Specifications,
    Comparison,
    Pricing,
    General,
    Reviews,
}

impl CacheIntent {
    pub fn for_source(category: SourceCategory) -> Self {
        match category {
            SourceCategory::OfficialSpecs => CacheIntent::Specifications,
            SourceCategory::Manuals => CacheIntent::Manual,
            SourceCategory::ComparisonSites => CacheIntent::Comparison,
            SourceCategory::RetailerData => CacheIntent::Pricing,
            SourceCategory::UserReviews | SourceCategory::Forum | SourceCategory::Video => {
                CacheIntent::Reviews
            }
        }
    }

    pub fn ttl(&self, config: &TtlConfig) -> Duration {
        let secs = match self {
            CacheIntent::Manual => config.manual_secs,
            CacheIntent::Specifications => config.specs_secs,
            CacheIntent::Comparison => config.comparison_secs,
            CacheIntent::Pricing => config.pricing_secs,
            CacheIntent::General => config.general_secs,
            CacheIntent::Reviews => config.reviews_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub results: Vec<SearchHit>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub query: String,
    pub domain_filter: Vec<String>,
    pub provider: String,
    pub count: usize,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage behind [`SearchCache`].
///
/// Implementations must make `put` atomic per key; readers may observe either
/// the old or the new entry, never a mix.
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether calls may block on I/O and belong on the blocking pool.
    fn is_blocking(&self) -> bool {
        false
    }
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
    fn len(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = domains
        .iter()
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Stable, order-independent cache key.
pub fn cache_key(query: &str, domain_filter: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize_domains(domain_filter).join(",").as_bytes());
    hex::encode(hasher.finalize())
}

/// Cheap to clone; clones share the backend and the counters.
#[derive(Clone)]
pub struct SearchCache {
    backend: Arc<dyn CacheBackend>,
    ttl: TtlConfig,
    enabled: bool,
    counters: Arc<Counters>,
}

impl SearchCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: TtlConfig) -> Self {
        Self {
            backend,
            ttl,
            enabled: true,
            counters: Arc::new(Counters::default()),
        }
    }

    /// In-process cache with default TTLs.
    pub fn in_memory(max_entries: usize) -> Self {
        Self::new(Arc::new(MemoryBackend::new(max_entries)), TtlConfig::default())
    }

    /// Pick the backend from configuration: a shared SQLite store when a
    /// location is configured and opens cleanly, the in-process map otherwise.
    pub fn from_config(config: &CacheConfig) -> Self {
        let backend: Arc<dyn CacheBackend> = match config.store_location() {
            Some(path) => match SqliteBackend::open(&path) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Cache store unavailable, using in-process cache"
                    );
                    Arc::new(MemoryBackend::new(config.max_entries))
                }
            },
            None => Arc::new(MemoryBackend::new(config.max_entries)),
        };
        tracing::info!(backend = backend.name(), enabled = config.enabled, "Search cache ready");

        let mut cache = Self::new(backend, config.ttl.clone());
        cache.enabled = config.enabled;
        cache
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Cached results for `(query, domain_filter)`, or `None` on miss, expiry
    /// or any backend error.
    pub fn get(&self, query: &str, domain_filter: &[String]) -> Option<Vec<SearchHit>> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(query, domain_filter);
        match self.backend.get(&key) {
            Ok(Some(entry)) if !entry.is_expired(Utc::now()) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, count = entry.count, provider = %entry.provider, "Cache hit");
                Some(entry.results)
            }
            Ok(Some(_)) => {
                if let Err(e) = self.backend.remove(&key) {
                    self.record_error("remove", &e);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache entry expired");
                None
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.record_error("get", &e);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store results with the TTL of `intent`'s volatility class.
    pub fn set(&self, query: &str, domain_filter: &[String], results: &[SearchHit], intent: CacheIntent) {
        let ttl = intent.ttl(&self.ttl);
        self.set_with_ttl(query, domain_filter, results, ttl);
    }

    pub fn set_with_ttl(&self, query: &str, domain_filter: &[String], results: &[SearchHit], ttl: Duration) {
        if !self.enabled {
            return;
        }
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let entry = CacheEntry {
            results: results.to_vec(),
            cached_at: now,
            expires_at: now + ttl,
            query: query.to_string(),
            domain_filter: normalize_domains(domain_filter),
            provider: results
                .first()
                .map(|h| h.provider.clone())
                .unwrap_or_else(|| "none".to_string()),
            count: results.len(),
        };
        let key = cache_key(query, domain_filter);
        match self.backend.put(&key, &entry) {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_error("put", &e),
        }
    }

    /// [`get`](Self::get) for async callers; blocking backends run on the
    /// blocking pool.
    pub async fn lookup(&self, query: &str, domain_filter: &[String]) -> Option<Vec<SearchHit>> {
        if !self.backend.is_blocking() {
            return self.get(query, domain_filter);
        }
        let cache = self.clone();
        let query = query.to_string();
        let domains = domain_filter.to_vec();
        match tokio::task::spawn_blocking(move || cache.get(&query, &domains)).await {
            Ok(hits) => hits,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Cache lookup task failed, treating as miss");
                None
            }
        }
    }

    /// [`set_with_ttl`](Self::set_with_ttl) for async callers.
    pub async fn store(&self, query: &str, domain_filter: &[String], results: Vec<SearchHit>, ttl: Duration) {
        if !self.backend.is_blocking() {
            self.set_with_ttl(query, domain_filter, &results, ttl);
            return;
        }
        let cache = self.clone();
        let query = query.to_string();
        let domains = domain_filter.to_vec();
        if let Err(e) =
            tokio::task::spawn_blocking(move || cache.set_with_ttl(&query, &domains, &results, ttl)).await
        {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "Cache store task failed");
        }
    }

    /// TTL of a volatility class under this cache's configuration.
    pub fn ttl_for(&self, intent: CacheIntent) -> Duration {
        intent.ttl(&self.ttl)
    }

    pub fn invalidate(&self, query: &str, domain_filter: &[String]) {
        let key = cache_key(query, domain_filter);
        if let Err(e) = self.backend.remove(&key) {
            self.record_error("remove", &e);
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.backend.clear() {
            self.record_error("clear", &e);
        }
    }

    pub fn len(&self) -> usize {
        self.backend.len().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn record_error(&self, operation: &str, error: &CacheError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(backend = self.backend.name(), operation, error = %error, "Cache operation failed, treating as miss");
    }
}
