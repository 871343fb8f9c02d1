//! Retrieval filters.

use super::Category;
use serde::{Deserialize, Serialize};

/// Absolute time window in Unix seconds, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Window start (Unix seconds).
    pub start: u64,
    /// Window end (Unix seconds).
    pub end: u64,
}

impl TimeRange {
    /// Creates a time range, swapping the bounds if given in reverse.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Whether `ts` falls within the window.
    #[must_use]
    pub const fn contains(&self, ts: u64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Structured filter applied to every retrieval and maintenance scan.
///
/// The agent scope is not part of the filter: callers address a specific
/// per-agent store (or fan out through the pool) before filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilter {
    /// Restrict to a namespace partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Restrict to a category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    /// Include soft-deleted records (maintenance scans only).
    #[serde(default)]
    pub include_soft_deleted: bool,
    /// Drop records below this importance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_importance: Option<f32>,
    /// Restrict to records created within the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

impl MemoryFilter {
    /// Creates an empty filter (live records only).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restricts to a category.
    #[must_use]
    pub const fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    /// Includes soft-deleted records.
    #[must_use]
    pub const fn with_soft_deleted(mut self) -> Self {
        self.include_soft_deleted = true;
        self
    }

    /// Sets a minimum importance.
    #[must_use]
    pub const fn with_min_importance(mut self, min: f32) -> Self {
        self.min_importance = Some(min);
        self
    }

    /// Restricts to a creation-time window.
    #[must_use]
    pub const fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Stable fingerprint for cache keying.
    ///
    /// Two filters that select the same rows produce the same fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "ns={};cat={};sd={};imp={};tr={}",
            self.namespace.as_deref().unwrap_or("-"),
            self.category.map_or("-", Category::as_str),
            u8::from(self.include_soft_deleted),
            self.min_importance
                .map_or_else(|| "-".to_string(), |v| format!("{v:.4}")),
            self.time_range
                .map_or_else(|| "-".to_string(), |r| format!("{}..{}", r.start, r.end)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_range_swaps_reversed_bounds() {
        let r = TimeRange::new(100, 10);
        assert_eq!(r.start, 10);
        assert_eq!(r.end, 100);
        assert!(r.contains(10));
        assert!(r.contains(100));
        assert!(!r.contains(101));
    }

    #[test]
    fn fingerprint_distinguishes_filters() {
        let base = MemoryFilter::new();
        let ns = MemoryFilter::new().with_namespace("work");
        let cat = MemoryFilter::new().with_category(Category::Rule);
        assert_ne!(base.fingerprint(), ns.fingerprint());
        assert_ne!(base.fingerprint(), cat.fingerprint());
        assert_eq!(base.fingerprint(), MemoryFilter::new().fingerprint());
    }
}
