//! Cache key construction.
//!
//! Keys have the shape `<kind>:<part>[:<part>...][:<canonical-json>]`. Filter
//! objects are rendered as JSON with object keys sorted at every depth, so two
//! logically equal queries always map to the same entry.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

/// Builder for namespaced cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    raw: String,
}

impl CacheKey {
    pub fn new(kind: &str) -> Self {
        Self {
            raw: kind.to_string(),
        }
    }

    /// Append a discriminator segment such as an id or slug.
    pub fn part(mut self, segment: impl fmt::Display) -> Self {
        self.raw.push(':');
        self.raw.push_str(&segment.to_string());
        self
    }

    /// Append the canonical JSON rendering of a filter object.
    pub fn filters<T: Serialize + ?Sized>(mut self, filters: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(filters)?;
        let rendered = serde_json::to_string(&canonicalize(value))?;
        self.raw.push(':');
        self.raw.push_str(&rendered);
        Ok(self)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.raw
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(key, inner)| (key, canonicalize(inner)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Order-insensitive rendering of a raw query string.
///
/// Empty pairs are dropped; pair order is normalized, values are kept verbatim.
pub fn canonical_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    let mut pairs: Vec<&str> = query.split('&').filter(|pair| !pair.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}
