//! Fusion Executor
//!
//! Merges same-field facts from several sources into one confidence-scored
//! value per field. Numeric values within the agreement tolerance count as
//! equal; anything else is a conflict, resolved by the fixed source priority
//! order and kept flagged with its alternatives for audit.
//!
//! Confidence per fact (defaults shown, all configurable):
//! - base: reliability of the most reliable source backing the selected value × 100
//! - +5 per additional agreeing source, at most +15
//! - −20 when an alternative differs numerically by more than 10 %
//! - clamped to [0, 100]

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use super::fusion_planner::FusionPlan;
use crate::config::FusionConfig;
use crate::types::{estimate_tokens, RetrievedItem, SourceCategory, SourceFact};

static NUMBER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"-?\d+(?:[.,]\d+)*").expect("number regex is valid"));
static THOUSANDS_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^\d{1,3}(?:\.\d{3})+$").expect("thousands regex is valid"));

// ============================================================================
// Normalization
// ============================================================================

const FIELD_SYNONYMS: &[(&str, &[&str])] = &[
    ("torque", &["coppia", "coppia_max", "coppia_massima", "max_torque", "torque_max", "coppia_di_serraggio"]),
    ("voltage", &["tensione", "voltaggio", "volt", "tensione_batteria"]),
    ("weight", &["peso", "peso_netto", "weight_kg"]),
    ("power", &["potenza", "potenza_assorbita", "wattage"]),
    ("price", &["prezzo", "costo", "prezzo_di_listino"]),
    ("battery_capacity", &["capacita_batteria", "capacity", "capacita", "ah", "battery"]),
    ("speed", &["velocita", "giri", "rpm", "velocita_a_vuoto", "giri_al_minuto"]),
];

/// Canonical field key: lower snake case, accents folded, synonyms merged.
pub fn normalize_field_key(key: &str) -> String {
    let folded: String = key
        .trim()
        .trim_end_matches(':')
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'à' | 'á' => 'a',
            'è' | 'é' => 'e',
            'ì' | 'í' => 'i',
            'ò' | 'ó' => 'o',
            'ù' | 'ú' => 'u',
            c if c.is_alphanumeric() => c,
            _ => '_',
        })
        .collect();
    let key = folded
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    FIELD_SYNONYMS
        .iter()
        .find(|(canonical, synonyms)| *canonical == key || synonyms.contains(&key.as_str()))
        .map(|(canonical, _)| canonical.to_string())
        .unwrap_or(key)
}

/// Parse a number with either decimal convention ("5,0", "1.900", "1.234,56").
pub fn parse_number(token: &str) -> Option<f64> {
    let has_dot = token.contains('.');
    let has_comma = token.contains(',');
    let canonical = if has_dot && has_comma {
        // The later separator is the decimal one
        if token.rfind(',') > token.rfind('.') {
            token.replace('.', "").replace(',', ".")
        } else {
            token.replace(',', "")
        }
    } else if has_comma {
        token.replace(',', ".")
    } else if THOUSANDS_RE.is_match(token.trim_start_matches('-')) {
        token.replace('.', "")
    } else {
        token.to_string()
    };
    canonical.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedValue {
    /// Case, whitespace and decimal-separator folded text.
    pub text: String,
    pub number: Option<f64>,
}

pub fn normalize_value(value: &str) -> NormalizedValue {
    let lowered = value.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let number = NUMBER_RE.find(&collapsed).and_then(|m| parse_number(m.as_str()));
    let text = NUMBER_RE
        .replace_all(&collapsed, |caps: &regex::Captures| match parse_number(&caps[0]) {
            Some(n) => format!("{}", n),
            None => caps[0].to_string(),
        })
        .replace(' ', "");
    NormalizedValue { text, number }
}

/// `|a − b| / min(|a|, |b|)`.
pub fn relative_difference(a: f64, b: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    let base = a.abs().min(b.abs());
    if base == 0.0 {
        f64::INFINITY
    } else {
        (a - b).abs() / base
    }
}

/// Relative difference when both values are numeric.
fn numeric_difference(a: &NormalizedValue, b: &NormalizedValue) -> Option<f64> {
    Some(relative_difference(a.number?, b.number?))
}

// ============================================================================
// Output types
// ============================================================================

/// A discarded value kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub value: String,
    pub sources: Vec<SourceCategory>,
    /// Relative difference to the selected value; `None` for non-numeric values.
    pub relative_difference: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedFact {
    pub key: String,
    pub value: String,
    /// In [0, 100].
    pub confidence: f32,
    pub contributors: Vec<SourceFact>,
    pub conflicting: bool,
    pub resolution_note: String,
    pub needs_verification: bool,
    /// Mean reliability of all contributors.
    pub mean_reliability: f32,
    /// Distinct source categories backing the selected value.
    pub agreeing_sources: usize,
    /// Agreement requirement of the plan met.
    pub confirmed: bool,
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub key: String,
    pub values: Vec<(SourceCategory, String)>,
    /// Largest relative difference between the selected value and an alternative.
    pub relative_difference: Option<f64>,
    pub resolved_value: String,
    pub resolved_by: SourceCategory,
    pub needs_verification: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionResult {
    pub combined_evidence: Vec<FusedFact>,
    /// Supporting evidence kept within the token budget, highest priority first.
    pub snippets: Vec<RetrievedItem>,
    /// Share of requested evidence types that received at least one non-empty item.
    pub coverage_score: f32,
    pub conflicts_detected: Vec<ConflictRecord>,
    /// Mean of fused-fact confidences, 0 when there are none.
    pub confidence_score: f32,
    pub tokens_used: usize,
}

impl FusionResult {
    pub fn fact(&self, key: &str) -> Option<&FusedFact> {
        self.combined_evidence.iter().find(|f| f.key == key)
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct FusionExecutor {
    config: FusionConfig,
}

/// Contributors sharing one folded value.
struct ValueCluster {
    value: String,
    normalized: NormalizedValue,
    facts: Vec<SourceFact>,
}

impl ValueCluster {
    fn best_priority(&self) -> usize {
        self.facts.iter().map(|f| f.source.priority()).min().unwrap_or(usize::MAX)
    }

    fn max_reliability(&self) -> f32 {
        self.facts.iter().map(|f| f.reliability).fold(0.0, f32::max)
    }

    fn categories(&self) -> Vec<SourceCategory> {
        let mut categories: Vec<SourceCategory> = self.facts.iter().map(|f| f.source).collect();
        categories.sort();
        categories.dedup();
        categories
    }
}

impl FusionExecutor {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn execute(
        &self,
        plan: &FusionPlan,
        items: &[RetrievedItem],
        facts: &[SourceFact],
        token_budget: usize,
    ) -> FusionResult {
        let mut by_key: BTreeMap<String, Vec<SourceFact>> = BTreeMap::new();
        for fact in facts {
            if fact.value.trim().is_empty() {
                continue;
            }
            by_key
                .entry(normalize_field_key(&fact.field))
                .or_default()
                .push(fact.clone());
        }

        let mut combined = Vec::with_capacity(by_key.len());
        let mut conflicts = Vec::new();
        for (key, group) in by_key {
            let (fact, conflict) = self.fuse_field(&key, group, plan.min_agreement);
            if let Some(conflict) = conflict {
                conflicts.push(conflict);
            }
            combined.push(fact);
        }

        let coverage_score = coverage(plan, items);
        let (snippets, tokens_used) = select_snippets(items, token_budget);
        let confidence_score = if combined.is_empty() {
            0.0
        } else {
            combined.iter().map(|f| f.confidence).sum::<f32>() / combined.len() as f32
        };

        tracing::info!(
            facts = combined.len(),
            conflicts = conflicts.len(),
            coverage = coverage_score,
            confidence = confidence_score,
            snippets = snippets.len(),
            tokens_used,
            "Fusion complete"
        );

        FusionResult {
            combined_evidence: combined,
            snippets,
            coverage_score,
            conflicts_detected: conflicts,
            confidence_score,
            tokens_used,
        }
    }

    /// Fuse every fact reported for one (non-empty) field group.
    fn fuse_field(
        &self,
        key: &str,
        mut facts: Vec<SourceFact>,
        min_agreement: usize,
    ) -> (FusedFact, Option<ConflictRecord>) {
        facts.sort_by(|a, b| {
            a.source
                .priority()
                .cmp(&b.source.priority())
                .then(b.reliability.total_cmp(&a.reliability))
        });

        let clusters = self.cluster(&facts);
        let conflicting = clusters.len() > 1;

        // Agreement: highest reliability wins. Conflict: source priority wins.
        let selected_index = if conflicting {
            clusters
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.best_priority()
                        .cmp(&b.best_priority())
                        .then(b.max_reliability().total_cmp(&a.max_reliability()))
                })
                .map(|(i, _)| i)
                .unwrap_or(0)
        } else {
            0
        };
        let selected = &clusters[selected_index];
        let value = if conflicting {
            selected.facts[0].value.clone()
        } else {
            selected
                .facts
                .iter()
                .max_by(|a, b| {
                    a.reliability
                        .total_cmp(&b.reliability)
                        .then(b.source.priority().cmp(&a.source.priority()))
                })
                .map(|f| f.value.clone())
                .unwrap_or_default()
        };

        let alternatives: Vec<Alternative> = clusters
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != selected_index)
            .map(|(_, cluster)| Alternative {
                value: cluster.value.clone(),
                sources: cluster.categories(),
                relative_difference: numeric_difference(&selected.normalized, &cluster.normalized),
            })
            .collect();

        let max_difference = alternatives
            .iter()
            .filter_map(|a| a.relative_difference)
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |m| m.max(d))));
        let numeric_disagreement = max_difference.is_some_and(|d| d > self.config.verification_threshold);
        let textual_disagreement = alternatives.iter().any(|a| a.relative_difference.is_none());

        let agreeing_sources = selected.categories().len();
        let bonus = (agreeing_sources.saturating_sub(1) as f32 * self.config.corroboration_bonus)
            .min(self.config.corroboration_cap);
        let penalty = if numeric_disagreement {
            self.config.disagreement_penalty
        } else {
            0.0
        };
        let confidence = (selected.max_reliability() * 100.0 + bonus - penalty).clamp(0.0, 100.0);

        let confirmed = agreeing_sources >= min_agreement && !conflicting;
        // plans asking for corroboration flag whatever lacks it
        let unconfirmed = min_agreement >= 2 && !confirmed;
        let needs_verification = (confidence < self.config.verification_confidence && agreeing_sources < 2)
            || numeric_disagreement
            || textual_disagreement
            || unconfirmed;

        let mean_reliability = facts.iter().map(|f| f.reliability).sum::<f32>() / facts.len().max(1) as f32;

        let mut resolution_note = if conflicting {
            let others: Vec<String> = alternatives
                .iter()
                .map(|a| {
                    let sources: Vec<&str> = a.sources.iter().map(|s| s.label()).collect();
                    format!("{} ({})", a.value, sources.join(", "))
                })
                .collect();
            format!(
                "resolved by source priority: {} from {} over {}",
                value,
                selected.facts[0].source,
                others.join("; ")
            )
        } else {
            format!("{} source(s) agree", facts.len())
        };
        if unconfirmed {
            resolution_note.push_str(&format!(
                "; {} of {} agreeing sources required",
                agreeing_sources, min_agreement
            ));
        }

        let conflict = conflicting.then(|| ConflictRecord {
            key: key.to_string(),
            values: facts.iter().map(|f| (f.source, f.value.clone())).collect(),
            relative_difference: max_difference,
            resolved_value: value.clone(),
            resolved_by: selected.facts[0].source,
            needs_verification,
        });

        if conflicting {
            tracing::debug!(
                key,
                value = %value,
                alternatives = alternatives.len(),
                max_difference = ?max_difference,
                confidence,
                "Conflict resolved"
            );
        }

        let fact = FusedFact {
            key: key.to_string(),
            value,
            confidence,
            contributors: facts,
            conflicting,
            resolution_note,
            needs_verification,
            mean_reliability,
            agreeing_sources,
            confirmed,
            alternatives,
        };
        (fact, conflict)
    }

    /// Group facts into clusters of agreeing values. Facts arrive in priority
    /// order, so each cluster's first fact is its highest-priority one.
    fn cluster(&self, facts: &[SourceFact]) -> Vec<ValueCluster> {
        let mut clusters: Vec<ValueCluster> = Vec::new();
        for fact in facts {
            let normalized = normalize_value(&fact.value);
            let existing = clusters
                .iter_mut()
                .find(|c| self.agree(&c.normalized, &normalized));
            match existing {
                Some(cluster) => cluster.facts.push(fact.clone()),
                None => clusters.push(ValueCluster {
                    value: fact.value.clone(),
                    normalized,
                    facts: vec![fact.clone()],
                }),
            }
        }
        clusters
    }

    fn agree(&self, a: &NormalizedValue, b: &NormalizedValue) -> bool {
        match numeric_difference(a, b) {
            Some(diff) => diff <= self.config.agreement_tolerance,
            None => a.text == b.text,
        }
    }
}

impl Default for FusionExecutor {
    fn default() -> Self {
        Self::new(FusionConfig::default())
    }
}

/// Fraction of plan evidence types that received a non-empty item from one of
/// the group's sources.
fn coverage(plan: &FusionPlan, items: &[RetrievedItem]) -> f32 {
    if plan.groups.is_empty() {
        return 0.0;
    }
    let covered = plan
        .groups
        .iter()
        .filter(|group| {
            items.iter().any(|item| {
                group.sources.contains(&item.category)
                    && item.category.supplies(group.evidence_type)
                    && !item.evidence.is_empty()
            })
        })
        .count();
    covered as f32 / plan.groups.len() as f32
}

/// Non-empty items in source priority order, until the token budget is spent.
fn select_snippets(items: &[RetrievedItem], token_budget: usize) -> (Vec<RetrievedItem>, usize) {
    let mut ordered: Vec<&RetrievedItem> = items.iter().filter(|i| !i.evidence.is_empty()).collect();
    ordered.sort_by_key(|i| i.category.priority());

    let mut used = 0;
    let mut selected = Vec::new();
    for item in ordered {
        let tokens = estimate_tokens(&item.evidence.text());
        if used + tokens > token_budget {
            continue;
        }
        used += tokens;
        selected.push(item.clone());
    }
    (selected, used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::fusion_planner::{FusionStrategy, SourceGroup};
    use crate::rag::granularity::GranularityLevel;
    use crate::types::{Evidence, EvidenceType, SourceCategory::*};
    use chrono::Utc;

    fn fact(field: &str, value: &str, source: SourceCategory) -> SourceFact {
        SourceFact {
            field: field.into(),
            value: value.into(),
            source,
            source_url: None,
            reliability: source.default_reliability(),
            timestamp: Utc::now(),
        }
    }

    fn plan(types: &[(EvidenceType, &[SourceCategory])]) -> FusionPlan {
        FusionPlan {
            strategy: FusionStrategy::Complementary,
            groups: types
                .iter()
                .enumerate()
                .map(|(i, (evidence_type, sources))| SourceGroup {
                    sources: sources.to_vec(),
                    evidence_type: *evidence_type,
                    priority: i,
                    required: i == 0,
                    granularity: GranularityLevel::Sentence,
                })
                .collect(),
            min_agreement: 1,
            estimated_tokens: 0,
            estimated_latency_ms: 0,
            pruned_sources: Vec::new(),
            unsatisfied_constraints: Vec::new(),
            rationale: String::new(),
        }
    }

    fn snippet(category: SourceCategory, text: &str) -> RetrievedItem {
        RetrievedItem::new(
            category,
            Evidence::Snippet {
                title: String::new(),
                url: format!("https://{}.test", category),
                text: text.into(),
            },
            "test",
        )
    }

    #[test]
    fn test_official_wins_large_conflict() {
        let executor = FusionExecutor::default();
        let (fused, conflict) = executor.fuse_field(
            "torque",
            vec![fact("torque", "110 Nm", RetailerData), fact("torque", "135 Nm", OfficialSpecs)],
            1,
        );
        assert_eq!(fused.value, "135 Nm");
        assert!(fused.conflicting);
        assert!(fused.needs_verification);
        assert!((fused.confidence - 75.0).abs() < 1e-3);
        assert_eq!(fused.alternatives.len(), 1);
        assert_eq!(fused.alternatives[0].value, "110 Nm");
        assert_eq!(fused.alternatives[0].sources, vec![RetailerData]);

        let conflict = conflict.unwrap();
        assert_eq!(conflict.resolved_by, OfficialSpecs);
        let diff = conflict.relative_difference.unwrap();
        assert!((diff - 25.0 / 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_within_tolerance_agrees_and_takes_most_reliable() {
        let executor = FusionExecutor::default();
        let (fused, conflict) = executor.fuse_field(
            "torque",
            vec![fact("torque", "132 Nm", RetailerData), fact("torque", "135 Nm", Manuals)],
            2,
        );
        assert!(!fused.conflicting);
        assert!(conflict.is_none());
        assert_eq!(fused.value, "135 Nm");
        assert!((fused.confidence - 95.0).abs() < 1e-3);
        assert!((fused.mean_reliability - 0.8).abs() < 1e-6);
        assert_eq!(fused.agreeing_sources, 2);
        assert!(fused.confirmed);
        assert!(!fused.needs_verification);

        // reliability, not priority, picks the value when sources agree
        let mut trusted_retailer = fact("torque", "132 Nm", RetailerData);
        trusted_retailer.reliability = 0.99;
        let (fused, _) = executor.fuse_field(
            "torque",
            vec![fact("torque", "135 Nm", OfficialSpecs), trusted_retailer],
            1,
        );
        assert!(!fused.conflicting);
        assert_eq!(fused.value, "132 Nm");
    }

    #[test]
    fn test_moderate_conflict_is_flagged_without_penalty() {
        let executor = FusionExecutor::default();
        // 7.4 % apart: beyond agreement, below verification
        let (fused, _) = executor.fuse_field(
            "torque",
            vec![fact("torque", "135 Nm", OfficialSpecs), fact("torque", "145 Nm", RetailerData)],
            1,
        );
        assert!(fused.conflicting);
        assert!(!fused.needs_verification);
        assert!((fused.confidence - 95.0).abs() < 1e-3);
    }

    #[test]
    fn test_single_weak_source_needs_verification() {
        let executor = FusionExecutor::default();
        let (fused, _) = executor.fuse_field("weight", vec![fact("peso", "1,6 kg", Forum)], 1);
        assert!((fused.confidence - 50.0).abs() < 1e-3);
        assert!(fused.needs_verification);
    }

    #[test]
    fn test_unconfirmed_fact_flagged_when_agreement_required() {
        let executor = FusionExecutor::default();
        // official alone scores 95, above the confidence bar
        let (alone, _) = executor.fuse_field("torque", vec![fact("torque", "135 Nm", OfficialSpecs)], 1);
        assert!(alone.confirmed);
        assert!(!alone.needs_verification);

        let (fused, _) = executor.fuse_field("torque", vec![fact("torque", "135 Nm", OfficialSpecs)], 2);
        assert!(!fused.confirmed);
        assert!(fused.needs_verification);
        assert!(fused.resolution_note.contains("1 of 2"), "{}", fused.resolution_note);

        let mut triangulation = plan(&[(EvidenceType::Factual, &[OfficialSpecs, RetailerData])]);
        triangulation.min_agreement = 2;
        let facts = vec![
            fact("torque", "135 Nm", OfficialSpecs),
            fact("voltage", "18 V", OfficialSpecs),
            fact("voltage", "18V", RetailerData),
        ];
        let result = executor.execute(&triangulation, &[], &facts, 1000);
        assert!(result.fact("torque").unwrap().needs_verification);
        let voltage = result.fact("voltage").unwrap();
        assert!(voltage.confirmed);
        assert!(!voltage.needs_verification);
    }

    #[test]
    fn test_corroboration_bonus_is_capped() {
        let executor = FusionExecutor::default();
        let facts = vec![
            fact("voltage", "18 V", OfficialSpecs),
            fact("voltage", "18V", Manuals),
            fact("voltage", "18 v", ComparisonSites),
            fact("voltage", "18 V", RetailerData),
            fact("voltage", "18 V", UserReviews),
        ];
        let (fused, _) = executor.fuse_field("voltage", facts, 2);
        assert_eq!(fused.agreeing_sources, 5);
        assert!((fused.confidence - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_textual_conflict() {
        let executor = FusionExecutor::default();
        let (fused, conflict) = executor.fuse_field(
            "colore",
            vec![fact("colore", "Blu", UserReviews), fact("colore", "blu ", Forum), fact("colore", "Verde", OfficialSpecs)],
            1,
        );
        assert_eq!(fused.value, "Verde");
        assert!(fused.conflicting);
        assert!(fused.needs_verification);
        assert!(conflict.unwrap().relative_difference.is_none());
        assert_eq!(fused.alternatives[0].sources, vec![UserReviews, Forum]);
    }

    #[test]
    fn test_execute_groups_by_normalized_key() {
        let executor = FusionExecutor::default();
        let facts = vec![
            fact("Coppia", "135 Nm", OfficialSpecs),
            fact("torque", "110 Nm", RetailerData),
            fact("Tensione", "18 V", OfficialSpecs),
        ];
        let plan = plan(&[(EvidenceType::Factual, &[OfficialSpecs, RetailerData])]);
        let result = executor.execute(&plan, &[], &facts, 1000);

        assert_eq!(result.combined_evidence.len(), 2);
        assert_eq!(result.conflicts_detected.len(), 1);
        assert_eq!(result.fact("torque").unwrap().value, "135 Nm");
        assert_eq!(result.fact("voltage").unwrap().value, "18 V");
        // (75 + 95) / 2
        assert!((result.confidence_score - 85.0).abs() < 1e-3);
    }

    #[test]
    fn test_empty_input() {
        let result = FusionExecutor::default().execute(&plan(&[]), &[], &[], 1000);
        assert_eq!(result.confidence_score, 0.0);
        assert_eq!(result.coverage_score, 0.0);
        assert!(result.combined_evidence.is_empty());
    }

    #[test]
    fn test_coverage_counts_types_with_evidence() {
        let plan = plan(&[
            (EvidenceType::Factual, &[OfficialSpecs]),
            (EvidenceType::Experiential, &[UserReviews]),
        ]);
        let items = vec![snippet(OfficialSpecs, "Coppia 135 Nm"), snippet(UserReviews, "  ")];
        let result = FusionExecutor::default().execute(&plan, &items, &[], 1000);
        // the review snippet carries no title or text
        assert!((result.coverage_score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_snippets_respect_token_budget_and_priority() {
        let items = vec![
            snippet(Forum, &"f".repeat(40)),
            snippet(OfficialSpecs, &"o".repeat(40)),
            snippet(RetailerData, &"r".repeat(400)),
        ];
        let (selected, used) = select_snippets(&items, 30);
        let categories: Vec<SourceCategory> = selected.iter().map(|i| i.category).collect();
        assert_eq!(categories, vec![OfficialSpecs, Forum]);
        assert!(used <= 30);
    }

    #[test]
    fn test_normalization_helpers() {
        assert_eq!(normalize_field_key("Coppia max:"), "torque");
        assert_eq!(normalize_field_key("Velocità"), "speed");
        assert_eq!(normalize_field_key("Capacità batteria"), "battery_capacity");
        assert_eq!(normalize_field_key("Colore"), "colore");

        assert_eq!(parse_number("5,0"), Some(5.0));
        assert_eq!(parse_number("1.900"), Some(1900.0));
        assert_eq!(parse_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_number("2.5"), Some(2.5));

        assert_eq!(normalize_value("5,0 Ah").text, normalize_value("5.0Ah").text);
        assert_eq!(normalize_value("  18   V ").number, Some(18.0));
        assert!(normalize_value("Blu").number.is_none());

        assert!((relative_difference(135.0, 110.0) - 0.2272727).abs() < 1e-6);
        assert_eq!(relative_difference(0.0, 0.0), 0.0);
        assert!(relative_difference(0.0, 1.0).is_infinite());
    }
}
