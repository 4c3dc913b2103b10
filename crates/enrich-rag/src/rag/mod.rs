//! Retrieval decisions and evidence fusion: routing, context granularity,
//! the no-retrieval short-circuit, fact extraction, fusion planning and execution.

pub mod extraction;
pub mod fusion_executor;
pub mod fusion_planner;
pub mod granularity;
pub mod response;
pub mod retrieval_decision;
pub mod router;

// Re-export commonly used types
pub use extraction::{extract_unit_facts, facts_from_item, FactExtractor};
pub use fusion_executor::{
    normalize_field_key, normalize_value, relative_difference, Alternative, ConflictRecord, FusedFact,
    FusionExecutor, FusionResult,
};
pub use fusion_planner::{FusionPlan, FusionPlanner, FusionStrategy, SourceGroup};
pub use granularity::{relevance_density, GranularityDecision, GranularityLevel, GranularityPlanner};
pub use retrieval_decision::{
    KnowledgeClass, NoRetrievalDetector, RetrievalDecision, RetrievalNecessity, RetrievalStrategy,
};
pub use router::{IntentClass, Router, RoutingDecision, RoutingStrategy};
