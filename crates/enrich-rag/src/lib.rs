//! Retrieval-decision and evidence-fusion engine for catalogue enrichment.
//!
//! [`EnrichmentPipeline`] decides whether a request needs external lookup,
//! which source categories to consult and how much context to spend, then
//! merges the retrieved evidence into confidence-scored facts with lineage.

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod llm;
pub mod pipeline;
pub mod rag;
pub mod search;
pub mod telemetry;
pub mod types;

// Re-export primary types for convenience
pub use config::EnrichmentConfig;
pub use pipeline::{EnrichmentData, EnrichmentPipeline, EnrichmentResponse, ResponseMetadata};
pub use types::{EnrichmentRequest, Evidence, EvidenceType, RetrievedItem, SourceCategory, SourceFact};

pub use cache::{CacheIntent, SearchCache};
pub use error::{CacheError, GatewayError, SearchError};
pub use graph::{ProvenanceSummary, ProvenanceTracker};
pub use llm::{CallGateway, ClassificationService, Completion, CompletionRequest};
pub use search::{SearchClient, SearchHit, SearchOutcome, SearchProvider};

pub use anyhow::{Error, Result};
