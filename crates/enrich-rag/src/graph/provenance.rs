//! Per-request lineage graph.
//!
//! `source → extraction → fusion → generation → verification`. Edges are
//! typed and weighted; a node fed by N contributors receives N edges of
//! weight 1/N, so a node's provenance score is the reliability flowing in from
//! its sources.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{DfsPostOrder, EdgeRef, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rag::fusion_executor::FusedFact;
use crate::types::SourceCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceKind {
    Source,
    Extraction,
    Fusion,
    Generation,
    Verification,
}

impl ProvenanceKind {
    fn label(&self) -> &'static str {
        match self {
            ProvenanceKind::Source => "source",
            ProvenanceKind::Extraction => "extraction",
            ProvenanceKind::Fusion => "fusion",
            ProvenanceKind::Generation => "generation",
            ProvenanceKind::Verification => "verification",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceNode {
    pub id: String,
    pub kind: ProvenanceKind,
    pub label: String,
    #[serde(default)]
    pub source: Option<SourceCategory>,
    #[serde(default)]
    pub url: Option<String>,
    /// Reliability for sources, confidence (0-100) for fusion nodes.
    #[serde(default)]
    pub score: Option<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceRelation {
    ExtractedFrom,
    FusedFrom,
    GeneratedFrom,
    Verifies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEdge {
    pub relation: ProvenanceRelation,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub from: String,
    pub to: String,
    pub relation: ProvenanceRelation,
    pub weight: f32,
}

/// Serialisable view returned with the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceSummary {
    pub request_id: Uuid,
    pub nodes: Vec<ProvenanceNode>,
    pub edges: Vec<EdgeSummary>,
    pub counts: HashMap<ProvenanceKind, usize>,
    pub low_provenance: Vec<String>,
}

pub struct ProvenanceTracker {
    request_id: Uuid,
    graph: DiGraph<ProvenanceNode, ProvenanceEdge>,
    id_to_node: HashMap<String, NodeIndex>,
    // (category, url) -> source node, so one page is one source
    source_index: HashMap<(SourceCategory, String), NodeIndex>,
}

impl ProvenanceTracker {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            graph: DiGraph::new(),
            id_to_node: HashMap::new(),
            source_index: HashMap::new(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn add_node(
        &mut self,
        kind: ProvenanceKind,
        label: String,
        source: Option<SourceCategory>,
        url: Option<String>,
        score: Option<f32>,
    ) -> String {
        let id = format!("{}:{}", kind.label(), self.graph.node_count());
        let idx = self.graph.add_node(ProvenanceNode {
            id: id.clone(),
            kind,
            label,
            source,
            url,
            score,
            created_at: Utc::now(),
        });
        self.id_to_node.insert(id.clone(), idx);
        id
    }

    /// Link `parents` into `child` with weight 1/N each.
    fn link_all(&mut self, parents: &[String], child: &str, relation: ProvenanceRelation) {
        let Some(&child_idx) = self.id_to_node.get(child) else {
            return;
        };
        let parent_indices: Vec<NodeIndex> = parents
            .iter()
            .filter_map(|id| self.id_to_node.get(id).copied())
            .collect();
        if parent_indices.is_empty() {
            return;
        }
        let weight = 1.0 / parent_indices.len() as f32;
        for parent in parent_indices {
            self.graph.add_edge(parent, child_idx, ProvenanceEdge { relation, weight });
        }
    }

    /// Source page; repeated calls for the same category and URL return the same node.
    pub fn record_source(&mut self, category: SourceCategory, url: Option<&str>, reliability: f32) -> String {
        let key = (category, url.unwrap_or_default().to_string());
        if let Some(&idx) = self.source_index.get(&key) {
            return self.graph[idx].id.clone();
        }
        let label = match url {
            Some(url) => format!("{} {}", category, url),
            None => category.to_string(),
        };
        let id = self.add_node(
            ProvenanceKind::Source,
            label,
            Some(category),
            url.map(str::to_string),
            Some(reliability),
        );
        if let Some(&idx) = self.id_to_node.get(&id) {
            self.source_index.insert(key, idx);
        }
        id
    }

    pub fn record_extraction(&mut self, source_id: &str, field: &str, value: &str) -> Option<String> {
        let source = self.id_to_node.get(source_id).map(|&idx| self.graph[idx].source)?;
        let id = self.add_node(
            ProvenanceKind::Extraction,
            format!("{} = {}", field, value),
            source,
            None,
            None,
        );
        self.link_all(&[source_id.to_string()], &id, ProvenanceRelation::ExtractedFrom);
        Some(id)
    }

    pub fn record_fusion(&mut self, key: &str, value: &str, confidence: f32, extraction_ids: &[String]) -> String {
        let id = self.add_node(
            ProvenanceKind::Fusion,
            format!("{} = {}", key, value),
            None,
            None,
            Some(confidence),
        );
        self.link_all(extraction_ids, &id, ProvenanceRelation::FusedFrom);
        id
    }

    /// Source, extraction and fusion nodes for one fused fact.
    pub fn record_fused_fact(&mut self, fact: &FusedFact) -> String {
        let mut extraction_ids = Vec::with_capacity(fact.contributors.len());
        for contributor in &fact.contributors {
            let source_id = self.record_source(
                contributor.source,
                contributor.source_url.as_deref(),
                contributor.reliability,
            );
            if let Some(id) = self.record_extraction(&source_id, &contributor.field, &contributor.value) {
                extraction_ids.push(id);
            }
        }
        self.record_fusion(&fact.key, &fact.value, fact.confidence, &extraction_ids)
    }

    /// Generated output (e.g. a drafted sentence) built from fused facts.
    pub fn record_generation(&mut self, label: &str, fusion_ids: &[String]) -> String {
        let id = self.add_node(ProvenanceKind::Generation, label.to_string(), None, None, None);
        self.link_all(fusion_ids, &id, ProvenanceRelation::GeneratedFrom);
        id
    }

    pub fn record_verification(&mut self, target_id: &str, verified: bool, note: &str) -> Option<String> {
        if !self.id_to_node.contains_key(target_id) {
            return None;
        }
        let label = format!("{}: {}", if verified { "verified" } else { "unverified" }, note);
        let id = self.add_node(
            ProvenanceKind::Verification,
            label,
            None,
            None,
            Some(if verified { 1.0 } else { 0.0 }),
        );
        self.link_all(&[target_id.to_string()], &id, ProvenanceRelation::Verifies);
        Some(id)
    }

    /// Ordered chain of operations behind a node, sources first, the node last.
    pub fn trace_provenance(&self, node_id: &str) -> Vec<ProvenanceNode> {
        let Some(&start) = self.id_to_node.get(node_id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = DfsPostOrder::new(reversed, start);
        let mut chain = Vec::new();
        while let Some(idx) = dfs.next(reversed) {
            chain.push(self.graph[idx].clone());
        }
        chain
    }

    /// Reliability reaching a node: sum over incoming edges of weight × parent score.
    pub fn provenance_score(&self, node_id: &str) -> f32 {
        let Some(&idx) = self.id_to_node.get(node_id) else {
            return 0.0;
        };
        let mut memo = HashMap::new();
        self.score_at(idx, &mut memo)
    }

    fn score_at(&self, idx: NodeIndex, memo: &mut HashMap<NodeIndex, f32>) -> f32 {
        if let Some(&score) = memo.get(&idx) {
            return score;
        }
        let node = &self.graph[idx];
        let score = if node.kind == ProvenanceKind::Source {
            node.score.unwrap_or(0.0)
        } else {
            let incoming: Vec<(NodeIndex, f32)> = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| (e.source(), e.weight().weight))
                .collect();
            incoming
                .into_iter()
                .map(|(parent, weight)| weight * self.score_at(parent, memo))
                .sum()
        };
        memo.insert(idx, score);
        score
    }

    /// Fusion and generation nodes whose provenance score falls below `threshold`.
    pub fn low_provenance_nodes(&self, threshold: f32) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                matches!(
                    self.graph[idx].kind,
                    ProvenanceKind::Fusion | ProvenanceKind::Generation
                )
            })
            .map(|idx| self.graph[idx].id.clone())
            .filter(|id| self.provenance_score(id) < threshold)
            .collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&ProvenanceNode> {
        self.id_to_node.get(node_id).map(|&idx| &self.graph[idx])
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn summary(&self, low_provenance_threshold: f32) -> ProvenanceSummary {
        let mut counts = HashMap::new();
        for node in self.graph.node_weights() {
            *counts.entry(node.kind).or_insert(0) += 1;
        }
        ProvenanceSummary {
            request_id: self.request_id,
            nodes: self.graph.node_weights().cloned().collect(),
            edges: self
                .graph
                .edge_references()
                .map(|e| EdgeSummary {
                    from: self.graph[e.source()].id.clone(),
                    to: self.graph[e.target()].id.clone(),
                    relation: e.weight().relation,
                    weight: e.weight().weight,
                })
                .collect(),
            counts,
            low_provenance: self.low_provenance_nodes(low_provenance_threshold),
        }
    }
}

impl Default for ProvenanceTracker {
    fn default() -> Self {
        Self::new()
    }
}
