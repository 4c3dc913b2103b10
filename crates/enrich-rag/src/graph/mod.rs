pub mod provenance;

pub use provenance::{
    EdgeSummary, ProvenanceEdge, ProvenanceKind, ProvenanceNode, ProvenanceRelation, ProvenanceSummary,
    ProvenanceTracker,
};
