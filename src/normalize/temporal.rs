//! Temporal phrase extraction.
//!
//! Recognizes a documented catalog of Turkish and English temporal
//! expressions in folded text and resolves them to absolute time windows
//! anchored at the query timestamp. The windows feed recall-time
//! `created_at` filters.

use crate::models::TimeRange;
use regex::Regex;
use std::sync::OnceLock;

/// Seconds per day.
const DAY: u64 = 86_400;

/// A recognized temporal phrase with its resolved window.
#[derive(Debug, Clone)]
pub struct TemporalRef {
    /// The matched phrase (folded form).
    pub phrase: String,
    /// The absolute window it resolves to.
    pub range: TimeRange,
}

/// Fixed phrases and their windows as day offsets relative to now:
/// `(phrase, start_days_back, end_days_back)` where the window is
/// `[now - start*DAY, now - end*DAY]`. Negative offsets reach forward.
const FIXED_PHRASES: [(&str, i64, i64); 18] = [
    // Turkish
    ("dun aksam", 1, 0),
    ("dun gece", 1, 0),
    ("dun", 1, 0),
    ("bugun", 1, 0),
    ("gecen hafta", 7, 0),
    ("gecen ay", 30, 0),
    ("gecen yil", 365, 0),
    ("bu hafta", 7, 0),
    ("bu ay", 30, 0),
    ("obur gun", -2, 0),
    ("yarin", -1, 0),
    // English
    ("yesterday evening", 1, 0),
    ("last night", 1, 0),
    ("yesterday", 1, 0),
    ("last week", 7, 0),
    ("last month", 30, 0),
    ("this week", 7, 0),
    ("tomorrow", -1, 0),
];

fn relative_regexes() -> &'static [(Regex, u64); 4] {
    static REGEXES: OnceLock<[(Regex, u64); 4]> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            // "3 days ago", "son 3 gun" style counts with their day multiplier.
            (Regex::new(r"\b(\d{1,3}) days? ago\b").expect("static regex"), 1),
            (Regex::new(r"\b(\d{1,3}) gun once\b").expect("static regex"), 1),
            (Regex::new(r"\bson (\d{1,3}) gun\b").expect("static regex"), 1),
            (
                Regex::new(r"\b(\d{1,2}) weeks? ago\b").expect("static regex"),
                7,
            ),
        ]
    })
}

fn offset_range(now: u64, start_days_back: i64, end_days_back: i64) -> TimeRange {
    let bound = |days_back: i64| -> u64 {
        if days_back >= 0 {
            #[allow(clippy::cast_sign_loss)]
            now.saturating_sub(days_back as u64 * DAY)
        } else {
            #[allow(clippy::cast_sign_loss)]
            now.saturating_add((-days_back) as u64 * DAY)
        }
    };
    TimeRange::new(bound(start_days_back), bound(end_days_back))
}

/// Extracts temporal references from folded text.
///
/// Fixed phrases are matched longest-first so "dun aksam" wins over "dun";
/// each source span contributes at most one reference.
#[must_use]
pub fn extract_temporal_refs(folded: &str, now: u64) -> Vec<TemporalRef> {
    let mut refs = Vec::new();
    let mut consumed = folded.to_string();

    for (phrase, start_back, end_back) in FIXED_PHRASES {
        if consumed.contains(phrase) {
            refs.push(TemporalRef {
                phrase: phrase.to_string(),
                range: offset_range(now, start_back, end_back),
            });
            // Blank the span so "dun" does not re-match inside "dun aksam".
            consumed = consumed.replace(phrase, " ");
        }
    }

    for (regex, day_multiplier) in relative_regexes() {
        if let Some(caps) = regex.captures(&consumed)
            && let Some(count) = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok())
        {
            let days = count.saturating_mul(*day_multiplier);
            refs.push(TemporalRef {
                phrase: caps[0].to_string(),
                range: TimeRange::new(now.saturating_sub(days * DAY), now),
            });
        }
    }

    refs
}
