//! Lenient reading of model JSON output.
//!
//! Models wrap their answers in markdown fences, add prose around them, or
//! stop mid-object. [`ModelReply`] keeps the parsed value when the embedded
//! object is valid and otherwise answers field lookups from the raw text.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("quoted string regex is valid"));

/// A model completion, parsed as far as it allows.
#[derive(Debug, Clone)]
pub struct ModelReply<'a> {
    raw: &'a str,
    value: Option<Value>,
}

impl<'a> ModelReply<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let body = object_span(raw);
        let value = serde_json::from_str::<Value>(body).ok().filter(Value::is_object);
        Self { raw: body, value }
    }

    /// Whether the embedded object parsed as valid JSON.
    pub fn is_complete(&self) -> bool {
        self.value.is_some()
    }

    /// Typed view of a complete reply.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        self.value.clone().and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn string(&self, field: &str) -> Option<String> {
        if let Some(value) = &self.value {
            return value.get(field)?.as_str().map(str::to_string);
        }
        let re = field_regex(field, r#""((?:[^"\\]|\\.)*)""#)?;
        let captured = re.captures(self.raw)?.get(1)?.as_str();
        Some(unescape(captured))
    }

    pub fn strings(&self, field: &str) -> Option<Vec<String>> {
        if let Some(value) = &self.value {
            let items = value.get(field)?.as_array()?;
            return Some(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());
        }
        let re = field_regex(field, r"\[([^\]]*)\]")?;
        let inner = re.captures(self.raw)?.get(1)?.as_str();
        Some(
            QUOTED_RE
                .captures_iter(inner)
                .filter_map(|c| c.get(1).map(|m| unescape(m.as_str())))
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        if let Some(value) = &self.value {
            return value.get(field)?.as_f64();
        }
        let re = field_regex(field, r"(-?\d+(?:\.\d+)?)")?;
        re.captures(self.raw)?.get(1)?.as_str().parse().ok()
    }
}

/// The outermost `{...}` span of `raw`, fences and surrounding prose removed.
fn object_span(raw: &str) -> &str {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        (Some(start), _) => &cleaned[start..],
        _ => cleaned,
    }
}

fn field_regex(field: &str, value_pattern: &str) -> Option<Regex> {
    Regex::new(&format!(r#""{}"\s*:\s*{}"#, regex::escape(field), value_pattern)).ok()
}

fn unescape(s: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", s)).unwrap_or_else(|_| s.to_string())
}
