//! Fusion Planner
//!
//! Turns a routing decision and a granularity decision into a concrete
//! multi-source retrieval plan: which evidence types are needed, which source
//! categories supply each, and in what priority. An optimizer then enforces
//! external limits (distinct sources, token budget, latency) by trimming the
//! lowest-priority groups first.

use serde::{Deserialize, Serialize};

use super::granularity::{GranularityDecision, GranularityLevel};
use super::router::{IntentClass, RoutingDecision};
use crate::config::{FusionConfig, Limits};
use crate::types::{EvidenceType, SourceCategory};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// At least two independent sources must agree.
    Triangulation,
    /// Factual, experiential and pricing evidence side by side.
    Complementary,
    /// Every evidence type.
    Comprehensive,
    /// One good source is enough.
    SingleSource,
}

impl FusionStrategy {
    /// Evidence types, most important first.
    pub fn evidence_types(&self, intent: IntentClass) -> Vec<EvidenceType> {
        match self {
            FusionStrategy::Triangulation => vec![EvidenceType::Factual],
            FusionStrategy::Complementary => {
                vec![EvidenceType::Factual, EvidenceType::Experiential, EvidenceType::Pricing]
            }
            FusionStrategy::Comprehensive => vec![
                EvidenceType::Factual,
                EvidenceType::Comparative,
                EvidenceType::Experiential,
                EvidenceType::Pricing,
                EvidenceType::Instructional,
            ],
            FusionStrategy::SingleSource => vec![match intent {
                IntentClass::Pricing => EvidenceType::Pricing,
                IntentClass::HowTo => EvidenceType::Instructional,
                _ => EvidenceType::Factual,
            }],
        }
    }

    fn is_required(&self, evidence_type: EvidenceType, position: usize) -> bool {
        match self {
            FusionStrategy::Triangulation | FusionStrategy::SingleSource => position == 0,
            FusionStrategy::Complementary => true,
            FusionStrategy::Comprehensive => {
                matches!(evidence_type, EvidenceType::Factual | EvidenceType::Comparative)
            }
        }
    }

    /// Agreeing sources needed before a fact counts as confirmed.
    pub fn min_agreement(&self) -> usize {
        match self {
            FusionStrategy::Triangulation => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceGroup {
    pub sources: Vec<SourceCategory>,
    pub evidence_type: EvidenceType,
    /// 0 is the most important group.
    pub priority: usize,
    /// A required group keeps at least one source through any trimming.
    pub required: bool,
    pub granularity: GranularityLevel,
}

impl SourceGroup {
    pub fn estimated_tokens(&self) -> usize {
        tokens_per_source(self.granularity) * self.sources.len()
    }

    fn removable(&self) -> bool {
        self.sources.len() > 1 || !self.required
    }
}

/// Each source is expected to fill about half of its level's ceiling.
fn tokens_per_source(level: GranularityLevel) -> usize {
    level.token_ceiling() / 2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionPlan {
    pub strategy: FusionStrategy,
    /// Sorted by priority.
    pub groups: Vec<SourceGroup>,
    pub min_agreement: usize,
    pub estimated_tokens: usize,
    pub estimated_latency_ms: u64,
    /// Categories removed by the optimizer.
    pub pruned_sources: Vec<SourceCategory>,
    /// Constraints the optimizer could not satisfy without emptying a required group.
    pub unsatisfied_constraints: Vec<String>,
    pub rationale: String,
}

impl FusionPlan {
    /// Distinct source categories, in group order.
    pub fn sources(&self) -> Vec<SourceCategory> {
        distinct_sources(&self.groups)
    }

    pub fn evidence_types(&self) -> Vec<EvidenceType> {
        self.groups.iter().map(|g| g.evidence_type).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.sources.is_empty())
    }

    fn refresh_estimates(&mut self) {
        self.estimated_tokens = self.groups.iter().map(SourceGroup::estimated_tokens).sum();
        self.estimated_latency_ms = self
            .sources()
            .iter()
            .map(SourceCategory::estimated_latency_ms)
            .max()
            .unwrap_or(0);
    }
}

fn distinct_sources(groups: &[SourceGroup]) -> Vec<SourceCategory> {
    let mut sources = Vec::new();
    for group in groups {
        for source in &group.sources {
            if !sources.contains(source) {
                sources.push(*source);
            }
        }
    }
    sources
}

// ============================================================================
// Planner
// ============================================================================

pub struct FusionPlanner {
    config: FusionConfig,
    limits: Limits,
}

impl FusionPlanner {
    pub fn new(config: FusionConfig, limits: Limits) -> Self {
        Self { config, limits }
    }

    /// Strategy from intent text first, intent class second.
    pub fn select_strategy(&self, intent_text: &str, intent: IntentClass) -> FusionStrategy {
        let text = intent_text.to_lowercase();
        let has = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));

        if has(&["vale la pena", "conviene", "worth", "merita", "should i buy"]) {
            FusionStrategy::Complementary
        } else if has(&["recension", "review", "confront", "compar", " vs ", "versus"]) {
            FusionStrategy::Comprehensive
        } else if has(&["spec", "scheda tecnica", "dati tecnici", "caratteristiche tecniche", "coppia", "torque"]) {
            FusionStrategy::Triangulation
        } else if has(&["prezzo", "price", "costa", "come si usa", "how to", "istruzioni", "manuale"]) {
            FusionStrategy::SingleSource
        } else {
            match intent {
                IntentClass::Specifications => FusionStrategy::Triangulation,
                IntentClass::WorthBuying | IntentClass::General => FusionStrategy::Complementary,
                IntentClass::Review | IntentClass::Comparison => FusionStrategy::Comprehensive,
                IntentClass::Pricing | IntentClass::HowTo | IntentClass::Conceptual => FusionStrategy::SingleSource,
            }
        }
    }

    /// Plan under the configured limits.
    pub fn plan(
        &self,
        intent_text: &str,
        routing: &RoutingDecision,
        granularity: &GranularityDecision,
    ) -> FusionPlan {
        self.plan_with_limits(intent_text, routing, granularity, &self.limits)
    }

    /// Plan under explicit limits (e.g. tightened for light retrieval).
    pub fn plan_with_limits(
        &self,
        intent_text: &str,
        routing: &RoutingDecision,
        granularity: &GranularityDecision,
        limits: &Limits,
    ) -> FusionPlan {
        let strategy = self.select_strategy(intent_text, routing.intent_class);
        let per_type_cap = match strategy {
            FusionStrategy::SingleSource => 1,
            _ => self.config.max_sources_per_type.max(1),
        };

        let groups: Vec<SourceGroup> = strategy
            .evidence_types(routing.intent_class)
            .into_iter()
            .enumerate()
            .map(|(position, evidence_type)| {
                let mut sources = candidate_sources(evidence_type, routing);
                sources.truncate(per_type_cap);
                SourceGroup {
                    sources,
                    evidence_type,
                    priority: position,
                    required: strategy.is_required(evidence_type, position),
                    granularity: group_granularity(evidence_type, granularity.level),
                }
            })
            .collect();

        let mut plan = FusionPlan {
            strategy,
            groups,
            min_agreement: strategy.min_agreement(),
            estimated_tokens: 0,
            estimated_latency_ms: 0,
            pruned_sources: Vec::new(),
            unsatisfied_constraints: Vec::new(),
            rationale: format!(
                "{:?} for {:?} at {:?} granularity",
                strategy, routing.intent_class, granularity.level
            ),
        };
        plan.refresh_estimates();

        let plan = self.optimize(plan, limits);
        tracing::info!(
            strategy = ?plan.strategy,
            sources = ?plan.sources(),
            groups = plan.groups.len(),
            estimated_tokens = plan.estimated_tokens,
            estimated_latency_ms = plan.estimated_latency_ms,
            pruned = ?plan.pruned_sources,
            "Fusion plan"
        );
        plan
    }

    /// Enforce timeout, distinct-source and token limits, lowest priority first.
    pub fn optimize(&self, mut plan: FusionPlan, limits: &Limits) -> FusionPlan {
        let initial = distinct_sources(&plan.groups);

        // Timeout: prune slow categories before execution
        for group in plan.groups.iter_mut() {
            let before = group.sources.clone();
            group
                .sources
                .retain(|s| s.estimated_latency_ms() <= limits.timeout_ms);
            if group.sources.is_empty() && group.required {
                if let Some(fastest) = before.iter().min_by_key(|s| s.estimated_latency_ms()) {
                    group.sources.push(*fastest);
                    let note = format!("timeout: kept {} for required {:?} group", fastest, group.evidence_type);
                    tracing::warn!(source = %fastest, timeout_ms = limits.timeout_ms, "{}", note);
                    plan.unsatisfied_constraints.push(note);
                }
            }
        }
        plan.groups.retain(|g| !g.sources.is_empty());

        // Distinct sources: drop whole categories from the lowest-priority positions
        while distinct_sources(&plan.groups).len() > limits.max_sources {
            let Some(category) = removable_category(&plan.groups) else {
                let note = format!(
                    "max_sources {} exceeded by required groups ({} sources)",
                    limits.max_sources,
                    distinct_sources(&plan.groups).len()
                );
                tracing::warn!("{}", note);
                plan.unsatisfied_constraints.push(note);
                break;
            };
            for group in plan.groups.iter_mut() {
                group.sources.retain(|s| *s != category);
            }
            plan.groups.retain(|g| !g.sources.is_empty());
        }

        // Token budget: drop the last source of the lowest-priority removable group
        loop {
            let tokens: usize = plan.groups.iter().map(SourceGroup::estimated_tokens).sum();
            if tokens <= limits.token_budget {
                break;
            }
            let Some(group) = plan
                .groups
                .iter_mut()
                .rev()
                .find(|g| g.removable() && !g.sources.is_empty())
            else {
                let note = format!("token budget {} exceeded ({} estimated)", limits.token_budget, tokens);
                tracing::warn!("{}", note);
                plan.unsatisfied_constraints.push(note);
                break;
            };
            if let Some(removed) = group.sources.pop() {
                tracing::debug!(source = %removed, evidence = ?group.evidence_type, "Trimmed for token budget");
            }
            plan.groups.retain(|g| !g.sources.is_empty());
        }

        let remaining = distinct_sources(&plan.groups);
        plan.pruned_sources = initial.into_iter().filter(|s| !remaining.contains(s)).collect();
        plan.groups.sort_by_key(|g| g.priority);
        plan.refresh_estimates();
        plan
    }
}

impl Default for FusionPlanner {
    fn default() -> Self {
        Self::new(FusionConfig::default(), Limits::default())
    }
}

/// Suppliers of one evidence type: router primaries first, then secondaries,
/// then any other capable category by priority.
fn candidate_sources(evidence_type: EvidenceType, routing: &RoutingDecision) -> Vec<SourceCategory> {
    let mut ordered: Vec<SourceCategory> = Vec::new();
    let preferred = routing
        .primary_sources
        .iter()
        .chain(routing.secondary_sources.iter())
        .copied();
    for source in preferred.chain(SourceCategory::ALL) {
        if source.supplies(evidence_type) && !ordered.contains(&source) {
            ordered.push(source);
        }
    }
    ordered
}

fn group_granularity(evidence_type: EvidenceType, level: GranularityLevel) -> GranularityLevel {
    match evidence_type {
        EvidenceType::Pricing => GranularityLevel::Fact,
        EvidenceType::Instructional => level.max(GranularityLevel::Paragraph),
        _ => level,
    }
}

/// The category sitting at the lowest-priority position that can leave every
/// group it appears in without emptying a required group.
fn removable_category(groups: &[SourceGroup]) -> Option<SourceCategory> {
    let mut order: Vec<&SourceGroup> = groups.iter().collect();
    order.sort_by_key(|g| std::cmp::Reverse(g.priority));

    for group in order {
        for candidate in group.sources.iter().rev() {
            let allowed = groups
                .iter()
                .filter(|g| g.sources.contains(candidate))
                .all(|g| !g.required || g.sources.len() > 1);
            if allowed {
                return Some(*candidate);
            }
        }
    }
    None
}
