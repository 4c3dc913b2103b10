//! Granularity Planner
//!
//! Picks how much context a request deserves, from a single fact up to a
//! whole document. Each level carries a token ceiling and a chunk budget.

use serde::{Deserialize, Serialize};

use crate::config::GranularityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GranularityLevel {
    Fact,
    Sentence,
    Paragraph,
    Section,
    Document,
}

impl GranularityLevel {
    pub const ALL: [GranularityLevel; 5] = [
        GranularityLevel::Fact,
        GranularityLevel::Sentence,
        GranularityLevel::Paragraph,
        GranularityLevel::Section,
        GranularityLevel::Document,
    ];

    pub fn token_ceiling(&self) -> usize {
        match self {
            GranularityLevel::Fact => 256,
            GranularityLevel::Sentence => 512,
            GranularityLevel::Paragraph => 1200,
            GranularityLevel::Section => 3000,
            GranularityLevel::Document => 8000,
        }
    }

    pub fn max_chunks(&self) -> usize {
        match self {
            GranularityLevel::Fact => 1,
            GranularityLevel::Sentence => 3,
            GranularityLevel::Paragraph => 5,
            GranularityLevel::Section => 8,
            GranularityLevel::Document => 15,
        }
    }

    /// One step towards more context; `Document` stays put.
    pub fn promote(&self) -> Self {
        let i = *self as usize;
        Self::ALL[(i + 1).min(Self::ALL.len() - 1)]
    }

    /// One step towards less context; `Fact` stays put.
    pub fn demote(&self) -> Self {
        let i = *self as usize;
        Self::ALL[i.saturating_sub(1)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GranularityDecision {
    pub level: GranularityLevel,
    pub token_budget: usize,
    pub chunk_budget: usize,
    pub rationale: String,
    /// Relevance density that drove an adaptive step, if one was evaluated.
    #[serde(default)]
    pub relevance_density: Option<f32>,
}

impl GranularityDecision {
    pub fn at(level: GranularityLevel, rationale: impl Into<String>) -> Self {
        Self {
            level,
            token_budget: level.token_ceiling(),
            chunk_budget: level.max_chunks(),
            rationale: rationale.into(),
            relevance_density: None,
        }
    }
}

// Explicit enrichment types. Checked before any heuristic.
const TYPE_MAP: &[(&str, GranularityLevel)] = &[
    ("price", GranularityLevel::Fact),
    ("pricing", GranularityLevel::Fact),
    ("prezzo", GranularityLevel::Fact),
    ("availability", GranularityLevel::Fact),
    ("disponibilita", GranularityLevel::Fact),
    ("specs", GranularityLevel::Sentence),
    ("specifications", GranularityLevel::Sentence),
    ("specifiche", GranularityLevel::Sentence),
    ("attributes", GranularityLevel::Sentence),
    ("description", GranularityLevel::Paragraph),
    ("descrizione", GranularityLevel::Paragraph),
    ("features", GranularityLevel::Paragraph),
    ("caratteristiche", GranularityLevel::Paragraph),
    ("summary", GranularityLevel::Paragraph),
    ("review", GranularityLevel::Section),
    ("recensione", GranularityLevel::Section),
    ("comparison", GranularityLevel::Section),
    ("confronto", GranularityLevel::Section),
    ("worth_buying", GranularityLevel::Section),
    ("guide", GranularityLevel::Document),
    ("guida", GranularityLevel::Document),
    ("manual", GranularityLevel::Document),
    ("manuale", GranularityLevel::Document),
    ("how_to", GranularityLevel::Document),
    ("tutorial", GranularityLevel::Document),
];

// Free-text cues, most specific first.
const KEYWORD_CUES: &[(&[&str], GranularityLevel)] = &[
    (&["guida", "guide", "manuale", "manual", "istruzioni", "how to", "tutorial"], GranularityLevel::Document),
    (&["confronto", "compare", "recension", "review", "vale la pena", "worth", "opinion"], GranularityLevel::Section),
    (&["prezzo", "price", "costa", "disponibil", "availability"], GranularityLevel::Fact),
    (&["specs", "specific", "scheda tecnica", "dati tecnici", "coppia", "torque", "peso"], GranularityLevel::Sentence),
    (&["descri", "caratteristiche", "features", "panoramica", "overview"], GranularityLevel::Paragraph),
];

fn normalize_type(enrichment_type: &str) -> String {
    enrichment_type
        .trim()
        .to_lowercase()
        .replace(['-', ' '], "_")
        .replace('à', "a")
}

/// Share of query terms found in the retrieved texts, averaged over texts.
///
/// Returns `None` when there is nothing to measure (no usable query terms or
/// no non-empty texts).
pub fn relevance_density(query: &str, texts: &[String]) -> Option<f32> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        return None;
    }

    let coverages: Vec<f32> = texts
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|text| {
            let lower = text.to_lowercase();
            let found = terms.iter().filter(|term| lower.contains(term.as_str())).count();
            found as f32 / terms.len() as f32
        })
        .collect();
    if coverages.is_empty() {
        return None;
    }

    Some(coverages.iter().sum::<f32>() / coverages.len() as f32)
}

pub struct GranularityPlanner {
    config: GranularityConfig,
}

impl GranularityPlanner {
    pub fn new(config: GranularityConfig) -> Self {
        Self { config }
    }

    /// Level for an enrichment type; free text falls through to keyword and
    /// length heuristics.
    pub fn plan(&self, enrichment_type: &str) -> GranularityDecision {
        let normalized = normalize_type(enrichment_type);

        let decision = if let Some((name, level)) = TYPE_MAP.iter().find(|(name, _)| *name == normalized) {
            GranularityDecision::at(*level, format!("enrichment type '{}'", name))
        } else {
            let text = enrichment_type.to_lowercase();
            match KEYWORD_CUES
                .iter()
                .find_map(|(cues, level)| cues.iter().find(|c| text.contains(*c)).map(|c| (*c, *level)))
            {
                Some((cue, level)) => GranularityDecision::at(level, format!("keyword cue '{}'", cue)),
                None => {
                    let words = enrichment_type.split_whitespace().count();
                    let level = match words {
                        0..=4 => GranularityLevel::Sentence,
                        5..=12 => GranularityLevel::Paragraph,
                        _ => GranularityLevel::Section,
                    };
                    GranularityDecision::at(level, format!("length heuristic ({} words)", words))
                }
            }
        };

        tracing::debug!(
            level = ?decision.level,
            token_budget = decision.token_budget,
            rationale = %decision.rationale,
            "Granularity decision"
        );
        decision
    }

    /// Adaptive step after retrieval. Moves at most one level.
    pub fn adapt(&self, decision: &GranularityDecision, density: f32) -> GranularityDecision {
        let (level, note) = if density < self.config.promote_below {
            (decision.level.promote(), "promoted: low relevance density")
        } else if density > self.config.demote_above {
            (decision.level.demote(), "demoted: high relevance density")
        } else {
            (decision.level, "kept: relevance density in band")
        };

        if level != decision.level {
            tracing::info!(from = ?decision.level, to = ?level, density, "Granularity adapted");
        }

        let mut adapted = GranularityDecision::at(level, format!("{}; {}", decision.rationale, note));
        adapted.relevance_density = Some(density);
        adapted
    }
}

impl Default for GranularityPlanner {
    fn default() -> Self {
        Self::new(GranularityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_grow_monotonically() {
        for pair in GranularityLevel::ALL.windows(2) {
            assert!(pair[0].token_ceiling() < pair[1].token_ceiling());
            assert!(pair[0].max_chunks() < pair[1].max_chunks());
        }
    }

    #[test]
    fn test_explicit_type_mapping() {
        let planner = GranularityPlanner::default();
        assert_eq!(planner.plan("price").level, GranularityLevel::Fact);
        assert_eq!(planner.plan("Specs").level, GranularityLevel::Sentence);
        assert_eq!(planner.plan("description").level, GranularityLevel::Paragraph);
        assert_eq!(planner.plan("worth-buying").level, GranularityLevel::Section);
        assert_eq!(planner.plan("manuale").level, GranularityLevel::Document);
    }

    #[test]
    fn test_heuristics_without_type() {
        let planner = GranularityPlanner::default();
        assert_eq!(planner.plan("vale la pena comprarlo?").level, GranularityLevel::Section);
        assert_eq!(planner.plan("quanto costa adesso").level, GranularityLevel::Fact);
        assert_eq!(planner.plan("ciao").level, GranularityLevel::Sentence);
        let long = "scrivi un testo lungo e ricco per la pagina del prodotto con tutti i dettagli utili";
        assert_eq!(planner.plan(long).level, GranularityLevel::Section);
    }

    #[test]
    fn test_adapt_moves_one_step_within_bounds() {
        let planner = GranularityPlanner::default();
        let paragraph = planner.plan("description");

        assert_eq!(planner.adapt(&paragraph, 0.1).level, GranularityLevel::Section);
        assert_eq!(planner.adapt(&paragraph, 0.9).level, GranularityLevel::Paragraph.demote());
        assert_eq!(planner.adapt(&paragraph, 0.5).level, GranularityLevel::Paragraph);

        let document = planner.plan("guide");
        assert_eq!(planner.adapt(&document, 0.0).level, GranularityLevel::Document);
        let fact = planner.plan("price");
        assert_eq!(planner.adapt(&fact, 1.0).level, GranularityLevel::Fact);
    }

    #[test]
    fn test_adapted_budgets_follow_level() {
        let planner = GranularityPlanner::default();
        let adapted = planner.adapt(&planner.plan("specs"), 0.05);
        assert_eq!(adapted.level, GranularityLevel::Paragraph);
        assert_eq!(adapted.token_budget, 1200);
        assert_eq!(adapted.chunk_budget, 5);
        assert_eq!(adapted.relevance_density, Some(0.05));
    }

    #[test]
    fn test_relevance_density() {
        let texts = vec![
            "Trapano avvitatore BrandX con coppia elevata".to_string(),
            "Accessori da giardino".to_string(),
        ];
        let density = relevance_density("trapano brandx", &texts).unwrap();
        assert!((density - 0.5).abs() < 1e-6);
        assert!(relevance_density("a b", &texts).is_none());
        assert!(relevance_density("trapano", &[]).is_none());
    }
}
