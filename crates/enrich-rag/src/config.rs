use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub stages: StageToggles,
    pub limits: Limits,
    pub router: RouterConfig,
    pub granularity: GranularityConfig,
    pub fusion: FusionConfig,
    pub cache: CacheConfig,
    pub gateway: GatewayConfig,
    pub search: SearchConfig,
    /// Return every pipeline step in `debug_log` and log at debug level.
    /// Off, the log keeps failures and unmet constraints only.
    pub debug: bool,
}

/// Per-stage enable toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageToggles {
    pub no_retrieval_detection: bool,
    pub routing: bool,
    pub granularity: bool,
    pub fusion: bool,
    pub provenance: bool,
    /// Model-assisted routing (only used when a classification service is configured).
    pub model_routing: bool,
    /// Model-assisted retrieval-necessity classification.
    pub model_detection: bool,
    /// Model-assisted fact extraction from snippets.
    pub model_extraction: bool,
    /// Always run both routing strategies and combine them.
    pub ensemble: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            no_retrieval_detection: true,
            routing: true,
            granularity: true,
            fusion: true,
            provenance: true,
            model_routing: true,
            model_detection: true,
            model_extraction: false,
            ensemble: false,
        }
    }
}

/// External constraints enforced by the fusion plan optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_sources: usize,
    pub token_budget: usize,
    /// Soft timeout; categories slower than this are pruned before execution.
    pub timeout_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sources: 5,
            token_budget: 12_000,
            timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Rule confidence at or above which the model path is skipped (unless ensembling).
    pub rule_confidence_threshold: f32,
    /// Confidence distance within which both routing results are merged.
    pub ensemble_margin: f32,
    pub max_primary_sources: usize,
    pub max_secondary_sources: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rule_confidence_threshold: 0.75,
            ensemble_margin: 0.1,
            max_primary_sources: 3,
            max_secondary_sources: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GranularityConfig {
    /// Relevance density below which the level is promoted one step.
    pub promote_below: f32,
    /// Relevance density above which the level is demoted one step.
    pub demote_above: f32,
}

impl Default for GranularityConfig {
    fn default() -> Self {
        Self {
            promote_below: 0.3,
            demote_above: 0.8,
        }
    }
}

/// Fusion thresholds and confidence-formula constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Numeric values within this relative difference are equal.
    pub agreement_tolerance: f64,
    /// Conflicts above this relative difference need verification and are penalised.
    pub verification_threshold: f64,
    pub corroboration_bonus: f32,
    pub corroboration_cap: f32,
    pub disagreement_penalty: f32,
    /// Facts below this confidence with fewer than two sources need verification.
    pub verification_confidence: f32,
    pub max_sources_per_type: usize,
    /// Fused facts whose provenance score falls below this are reported as low-provenance.
    pub low_provenance_threshold: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            agreement_tolerance: 0.05,
            verification_threshold: 0.10,
            corroboration_bonus: 5.0,
            corroboration_cap: 15.0,
            disagreement_penalty: 20.0,
            verification_confidence: 70.0,
            max_sources_per_type: 3,
            low_provenance_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// SQLite file shared across processes.
    pub store_path: Option<PathBuf>,
    /// Persist to [`CacheConfig::default_store_path`] when no `store_path`
    /// is given. Without either the cache is the in-process map.
    pub persistent: bool,
    pub max_entries: usize,
    pub ttl: TtlConfig,
}

impl CacheConfig {
    /// Conventional location for a persistent store.
    pub fn default_store_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("enrich-rag")
            .join("search-cache.sqlite3")
    }

    /// Where the SQLite store lives, if one is wanted.
    pub fn store_location(&self) -> Option<PathBuf> {
        match &self.store_path {
            Some(path) => Some(path.clone()),
            None if self.persistent => Some(Self::default_store_path()),
            None => None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_path: None,
            persistent: false,
            max_entries: 1000,
            ttl: TtlConfig::default(),
        }
    }
}

/// Time-to-live per volatility class, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub manual_secs: u64,
    pub specs_secs: u64,
    pub comparison_secs: u64,
    pub pricing_secs: u64,
    pub general_secs: u64,
    pub reviews_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        const HOUR: u64 = 3600;
        Self {
            manual_secs: 30 * 24 * HOUR,
            specs_secs: 14 * 24 * HOUR,
            comparison_secs: 3 * 24 * HOUR,
            pricing_secs: 24 * HOUR,
            general_secs: 24 * HOUR,
            reviews_secs: 12 * HOUR,
        }
    }
}

/// Classification/extraction service and its rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// OpenAI-compatible chat completions endpoint. `None` disables model paths.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub requests_per_minute: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            requests_per_minute: 50,
            max_retries: 3,
            base_delay_ms: 1000,
            max_tokens: 300,
            timeout_secs: 30,
        }
    }
}

/// Real web search or the deterministic mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Live,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub mode: RetrievalMode,
    pub brave_api_key: Option<String>,
    pub serper_api_key: Option<String>,
    pub results_per_query: usize,
    /// Serve mock results when every live provider fails.
    pub mock_fallback: bool,
    /// Scale applied to category reliability for fallback results.
    pub fallback_reliability_factor: f32,
    pub timeout_secs: u64,
}

impl SearchConfig {
    /// Fill missing credentials from `BRAVE_API_KEY` / `SERPER_API_KEY`.
    pub fn with_env_credentials(mut self) -> Self {
        if self.brave_api_key.is_none() {
            self.brave_api_key = std::env::var("BRAVE_API_KEY").ok().filter(|k| !k.is_empty());
        }
        if self.serper_api_key.is_none() {
            self.serper_api_key = std::env::var("SERPER_API_KEY").ok().filter(|k| !k.is_empty());
        }
        self
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Live,
            brave_api_key: None,
            serper_api_key: None,
            results_per_query: 5,
            mock_fallback: true,
            fallback_reliability_factor: 0.5,
            timeout_secs: 10,
        }
    }
}

impl EnrichmentConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.limits.max_sources == 0 {
            return Err("limits.max_sources must be > 0".into());
        }
        if self.limits.token_budget == 0 {
            return Err("limits.token_budget must be > 0".into());
        }
        if self.limits.timeout_ms == 0 {
            return Err("limits.timeout_ms must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.router.rule_confidence_threshold) {
            return Err("router.rule_confidence_threshold must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.router.ensemble_margin) {
            return Err("router.ensemble_margin must be in [0.0, 1.0]".into());
        }
        if self.router.max_primary_sources == 0 {
            return Err("router.max_primary_sources must be > 0".into());
        }
        if self.granularity.promote_below >= self.granularity.demote_above {
            return Err("granularity.promote_below must be < demote_above".into());
        }
        if self.fusion.agreement_tolerance < 0.0 {
            return Err("fusion.agreement_tolerance must be >= 0".into());
        }
        if self.fusion.verification_threshold < self.fusion.agreement_tolerance {
            return Err("fusion.verification_threshold must be >= agreement_tolerance".into());
        }
        if self.fusion.max_sources_per_type == 0 {
            return Err("fusion.max_sources_per_type must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.fusion.low_provenance_threshold) {
            return Err("fusion.low_provenance_threshold must be in [0.0, 1.0]".into());
        }
        if self.gateway.requests_per_minute == 0 {
            return Err("gateway.requests_per_minute must be > 0".into());
        }
        if self.search.results_per_query == 0 {
            return Err("search.results_per_query must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.search.fallback_reliability_factor) {
            return Err("search.fallback_reliability_factor must be in [0.0, 1.0]".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}
