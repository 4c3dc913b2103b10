use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One enrichment request about a catalogued item. Built per call, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub title: String,
    pub vendor: String,
    pub sku: String,
    pub category: String,
    /// Free-text description of what the caller wants (e.g. "specs",
    /// "vale la pena comprarlo?", "Cos'è un motore brushless?").
    pub intent: String,
}

impl EnrichmentRequest {
    pub fn new(
        title: impl Into<String>,
        vendor: impl Into<String>,
        sku: impl Into<String>,
        category: impl Into<String>,
        intent: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            vendor: vendor.into(),
            sku: sku.into(),
            category: category.into(),
            intent: intent.into(),
        }
    }

    /// A request carrying any product identity (vendor, sku or title) is a
    /// product-enrichment request.
    pub fn is_product_enrichment(&self) -> bool {
        !self.vendor.trim().is_empty() || !self.sku.trim().is_empty() || !self.title.trim().is_empty()
    }

    /// Base search terms identifying the product.
    pub fn search_terms(&self) -> String {
        [self.vendor.as_str(), self.title.as_str(), self.sku.as_str()]
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Compact product context handed to model-assisted classifiers.
    pub fn product_context(&self) -> String {
        format!(
            "title: {}\nvendor: {}\nsku: {}\ncategory: {}",
            self.title, self.vendor, self.sku, self.category
        )
    }
}

// ============================================================================
// Source categories
// ============================================================================

/// Category of external knowledge source.
///
/// Declaration order is the fixed conflict-resolution priority: official
/// specifications win over manuals, which win over comparison sites, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    OfficialSpecs,
    Manuals,
    ComparisonSites,
    RetailerData,
    UserReviews,
    Forum,
    Video,
}

impl SourceCategory {
    /// All categories, highest priority first.
    pub const ALL: [SourceCategory; 7] = [
        SourceCategory::OfficialSpecs,
        SourceCategory::Manuals,
        SourceCategory::ComparisonSites,
        SourceCategory::RetailerData,
        SourceCategory::UserReviews,
        SourceCategory::Forum,
        SourceCategory::Video,
    ];

    /// Conflict-resolution rank, 0 is the most trusted.
    pub fn priority(&self) -> usize {
        *self as usize
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceCategory::OfficialSpecs => "official_specs",
            SourceCategory::Manuals => "manuals",
            SourceCategory::ComparisonSites => "comparison_sites",
            SourceCategory::RetailerData => "retailer_data",
            SourceCategory::UserReviews => "user_reviews",
            SourceCategory::Forum => "forum",
            SourceCategory::Video => "video",
        }
    }

    /// Parse a label as produced by a model. Accepts a few common spellings.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "official_specs" | "official" | "manufacturer" | "official_specifications" => {
                Some(SourceCategory::OfficialSpecs)
            }
            "manuals" | "manual" => Some(SourceCategory::Manuals),
            "comparison_sites" | "comparison" | "comparisons" => Some(SourceCategory::ComparisonSites),
            "retailer_data" | "retailer" | "retailers" | "shop" => Some(SourceCategory::RetailerData),
            "user_reviews" | "reviews" | "review" => Some(SourceCategory::UserReviews),
            "forum" | "forums" => Some(SourceCategory::Forum),
            "video" | "videos" => Some(SourceCategory::Video),
            _ => None,
        }
    }

    /// Baseline reliability in [0, 1] for facts captured from this category.
    pub fn default_reliability(&self) -> f32 {
        match self {
            SourceCategory::OfficialSpecs => 0.95,
            SourceCategory::Manuals => 0.9,
            SourceCategory::ComparisonSites => 0.75,
            SourceCategory::RetailerData => 0.7,
            SourceCategory::UserReviews => 0.6,
            SourceCategory::Forum => 0.5,
            SourceCategory::Video => 0.55,
        }
    }

    /// Typical end-to-end lookup latency, used by the plan optimizer.
    pub fn estimated_latency_ms(&self) -> u64 {
        match self {
            SourceCategory::OfficialSpecs => 1200,
            SourceCategory::Manuals => 1500,
            SourceCategory::ComparisonSites => 1800,
            SourceCategory::RetailerData => 1000,
            SourceCategory::UserReviews => 1500,
            SourceCategory::Forum => 2000,
            SourceCategory::Video => 2500,
        }
    }

    /// Static capability table: which evidence types this category can supply.
    pub fn evidence_types(&self) -> &'static [EvidenceType] {
        match self {
            SourceCategory::OfficialSpecs => &[EvidenceType::Factual],
            SourceCategory::Manuals => &[EvidenceType::Factual, EvidenceType::Instructional],
            SourceCategory::ComparisonSites => &[
                EvidenceType::Comparative,
                EvidenceType::Factual,
                EvidenceType::Pricing,
            ],
            SourceCategory::RetailerData => &[EvidenceType::Pricing, EvidenceType::Factual],
            SourceCategory::UserReviews => &[EvidenceType::Experiential],
            SourceCategory::Forum => &[EvidenceType::Experiential, EvidenceType::Instructional],
            SourceCategory::Video => &[EvidenceType::Instructional, EvidenceType::Experiential],
        }
    }

    pub fn supplies(&self, evidence_type: EvidenceType) -> bool {
        self.evidence_types().contains(&evidence_type)
    }

    /// Terms appended to the product search terms for this category.
    pub fn query_suffix(&self) -> &'static str {
        match self {
            SourceCategory::OfficialSpecs => "scheda tecnica specifiche",
            SourceCategory::Manuals => "manuale istruzioni",
            SourceCategory::ComparisonSites => "confronto",
            SourceCategory::RetailerData => "prezzo",
            SourceCategory::UserReviews => "recensioni opinioni",
            SourceCategory::Forum => "forum esperienze",
            SourceCategory::Video => "video prova",
        }
    }

    /// Domain filter for searches against this category.
    ///
    /// The official category is restricted to the vendor's own site.
    pub fn domain_filter(&self, vendor: &str) -> Vec<String> {
        let list: &[&str] = match self {
            SourceCategory::OfficialSpecs => {
                let slug: String = vendor
                    .to_lowercase()
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect();
                return if slug.is_empty() {
                    Vec::new()
                } else {
                    vec![format!("{}.com", slug)]
                };
            }
            SourceCategory::Manuals => &["manualslib.com", "manua.ls"],
            SourceCategory::ComparisonSites => &["idealo.it", "trovaprezzi.it"],
            SourceCategory::RetailerData => &["amazon.it", "leroymerlin.it", "manomano.it"],
            SourceCategory::UserReviews => &["trustpilot.com", "amazon.it"],
            SourceCategory::Forum => &["reddit.com"],
            SourceCategory::Video => &["youtube.com"],
        };
        list.iter().map(|d| d.to_string()).collect()
    }
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Category of information a source can supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Factual,
    Experiential,
    Comparative,
    Instructional,
    Pricing,
}

impl EvidenceType {
    pub const ALL: [EvidenceType; 5] = [
        EvidenceType::Factual,
        EvidenceType::Experiential,
        EvidenceType::Comparative,
        EvidenceType::Instructional,
        EvidenceType::Pricing,
    ];
}

// ============================================================================
// Evidence
// ============================================================================

/// A retrieved piece of evidence. The shape is fixed at ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// Free text returned by a search backend.
    Snippet {
        title: String,
        url: String,
        text: String,
    },
    /// A single key/value fact.
    Fact { field: String, value: String },
    /// A structured product listing (retailer or comparison page).
    Listing {
        title: String,
        url: String,
        price: Option<String>,
        attributes: Vec<(String, String)>,
    },
}

impl Evidence {
    pub fn url(&self) -> Option<&str> {
        match self {
            Evidence::Snippet { url, .. } | Evidence::Listing { url, .. } => Some(url),
            Evidence::Fact { .. } => None,
        }
    }

    /// Whether the evidence carries any content at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Evidence::Snippet { text, title, .. } => text.trim().is_empty() && title.trim().is_empty(),
            Evidence::Fact { value, .. } => value.trim().is_empty(),
            Evidence::Listing {
                price, attributes, ..
            } => price.is_none() && attributes.is_empty(),
        }
    }

    /// Plain-text rendering, used for token accounting and relevance density.
    pub fn text(&self) -> String {
        match self {
            Evidence::Snippet { title, text, .. } => format!("{} {}", title, text),
            Evidence::Fact { field, value } => format!("{}: {}", field, value),
            Evidence::Listing {
                title,
                price,
                attributes,
                ..
            } => {
                let mut parts = vec![title.clone()];
                if let Some(price) = price {
                    parts.push(format!("price: {}", price));
                }
                parts.extend(attributes.iter().map(|(k, v)| format!("{}: {}", k, v)));
                parts.join("; ")
            }
        }
    }
}

/// Evidence tagged with where and when it was retrieved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub category: SourceCategory,
    pub evidence: Evidence,
    pub reliability: f32,
    pub provider: String,
    pub retrieved_at: DateTime<Utc>,
}

impl RetrievedItem {
    pub fn new(category: SourceCategory, evidence: Evidence, provider: impl Into<String>) -> Self {
        Self {
            category,
            evidence,
            reliability: category.default_reliability(),
            provider: provider.into(),
            retrieved_at: Utc::now(),
        }
    }

    pub fn with_reliability(mut self, reliability: f32) -> Self {
        self.reliability = reliability.clamp(0.0, 1.0);
        self
    }
}

/// Atomic fact captured from one source. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFact {
    pub field: String,
    pub value: String,
    pub source: SourceCategory,
    pub source_url: Option<String>,
    pub reliability: f32,
    pub timestamp: DateTime<Utc>,
}

/// Quick token estimate (chars / 4).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}
