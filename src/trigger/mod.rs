//! Recall trigger detection and write-time importance scoring.
//!
//! Rule-based on purpose: trigger detection sits on the hot path of every
//! incoming query and must cost microseconds, not a model call. Ambiguous
//! queries resolve to `triggered = true` — a wasted recall is cheaper than
//! a missed memory.

use crate::models::Category;
use crate::normalize::ascii_fold;

/// Turkish positive trigger patterns (folded substrings).
const TURKISH_TRIGGERS: [&str; 34] = [
    "hatirl",
    "hatirliyor",
    "ne konustuk",
    "ne demistik",
    "ne karar",
    "gecen",
    "onceki",
    "daha once",
    "en son",
    "son konusma",
    "karar",
    "kararlastir",
    "soylemistim",
    "soylemistin",
    "demistim",
    "demistin",
    "anlatmistim",
    "bahsetmistik",
    "konusmustuk",
    "yapmistik",
    "almistik",
    "kurmustuk",
    "neydi",
    "kimdi",
    "nereye",
    "nereden",
    "ne zaman",
    "hangi",
    "tercihim",
    "tercih ettigim",
    "ayarlamistik",
    "planlamistik",
    "listemde",
    "notlarim",
];

/// English positive trigger patterns (folded substrings).
const ENGLISH_TRIGGERS: [&str; 18] = [
    "remember",
    "recall",
    "last time",
    "previously",
    "earlier",
    "we discussed",
    "we talked",
    "we decided",
    "we agreed",
    "you said",
    "i told you",
    "i mentioned",
    "what was",
    "what did",
    "when did",
    "which one did",
    "my preference",
    "my settings",
];

/// Anti-triggers: short conversational noise that never needs memory.
const ANTI_TRIGGERS: [&str; 16] = [
    "merhaba", "selam", "gunaydin", "iyi geceler", "tesekkur", "tesekkurler", "sagol", "tamam",
    "hello", "hi", "hey", "thanks", "thank you", "ok", "okay", "good morning",
];

/// Turkish past-tense suffixes (folded) checked word-finally.
const PAST_TENSE_SUFFIXES: [&str; 12] = [
    "mistik", "mustuk", "mistim", "mustum", "misti", "mustu", "dik", "duk", "tik", "tuk", "di",
    "du",
];

/// Importance cap applied to text originating from automated sources.
const CRON_IMPORTANCE_CAP: f32 = 0.4;

/// Decision markers for write-importance scoring.
const DECISION_MARKERS: [&str; 12] = [
    "karar", "kararlastirdik", "sectik", "secildi", "anlastik", "decided", "decision", "we chose",
    "agreed", "will use", "switching to", "final answer",
];

/// Rule-like imperative markers.
const RULE_MARKERS: [&str; 12] = [
    "her zaman", "asla", "kesinlikle", "yapma", "kural", "unutma", "always", "never", "must",
    "do not", "don't", "make sure",
];

/// Rule-based trigger detection and importance scoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerScorer;

impl TriggerScorer {
    /// Creates a scorer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decides whether a query would naturally require memory lookup.
    ///
    /// Positive patterns and the past-tense heuristic fire a recall;
    /// greetings, bare acknowledgements, and single emoji suppress it.
    /// Anything ambiguous triggers.
    #[must_use]
    pub fn should_recall(&self, query: &str) -> bool {
        let folded = ascii_fold(query);
        let trimmed = folded.trim();

        if trimmed.is_empty() {
            return false;
        }

        // Single emoji or punctuation-only input.
        if query.chars().count() <= 2 && !query.chars().any(char::is_alphanumeric) {
            return false;
        }

        let word_count = trimmed.split_whitespace().count();

        // One-word acknowledgements and greetings are anti-triggers only
        // when they make up the whole message.
        if word_count <= 2 {
            for anti in ANTI_TRIGGERS {
                if trimmed == anti || trimmed.starts_with(&format!("{anti} ")) {
                    return false;
                }
            }
        }

        for pattern in TURKISH_TRIGGERS.iter().chain(ENGLISH_TRIGGERS.iter()) {
            if trimmed.contains(pattern) {
                return true;
            }
        }

        if Self::has_past_tense_verb(trimmed) {
            return true;
        }

        // Ambiguous: prefer recall.
        word_count >= 3
    }

    /// Turkish past-tense morphological heuristic over word-final suffixes.
    fn has_past_tense_verb(folded: &str) -> bool {
        folded.split_whitespace().any(|word| {
            word.chars().count() >= 5
                && PAST_TENSE_SUFFIXES
                    .iter()
                    .any(|suffix| word.ends_with(suffix))
        })
    }

    /// Scores write-time importance in [0, 1] from text features.
    ///
    /// Cron-origin text is capped at 0.4 regardless of content: automated
    /// captures must never outrank something a human said once.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score_importance(&self, text: &str, category: Category, source: Option<&str>) -> f32 {
        let folded = ascii_fold(text);
        let mut score: f32 = 0.3;

        if DECISION_MARKERS.iter().any(|m| folded.contains(m)) {
            score += 0.25;
        }
        if RULE_MARKERS.iter().any(|m| folded.contains(m)) {
            score += 0.2;
        }

        // Length-and-density: substantial, information-dense text earns up
        // to 0.15.
        let words = folded.split_whitespace().count();
        let density_bonus = (words as f32 / 60.0).min(1.0) * 0.15;
        score += density_bonus;

        if category == Category::QaPair {
            score += 0.1;
        }
        if category == Category::Rule {
            score = 1.0;
        }

        if source.is_some_and(|s| s.contains("cron") || s.contains("sync")) {
            score = score.min(CRON_IMPORTANCE_CAP);
        }

        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turkish_recall_phrases_trigger() {
        let scorer = TriggerScorer::new();
        assert!(scorer.should_recall("geçen hafta ne konuştuk?"));
        assert!(scorer.should_recall("sunucu hakkında ne karar vermiştik"));
        assert!(scorer.should_recall("dün söylemiştim ya"));
    }

    #[test]
    fn english_recall_phrases_trigger() {
        let scorer = TriggerScorer::new();
        assert!(scorer.should_recall("do you remember the database password policy?"));
        assert!(scorer.should_recall("what did we decide about retries"));
        assert!(scorer.should_recall("last time you said something else"));
    }

    #[test]
    fn greetings_do_not_trigger() {
        let scorer = TriggerScorer::new();
        assert!(!scorer.should_recall("merhaba"));
        assert!(!scorer.should_recall("hello"));
        assert!(!scorer.should_recall("thanks"));
        assert!(!scorer.should_recall("ok"));
    }

    #[test]
    fn single_emoji_does_not_trigger() {
        let scorer = TriggerScorer::new();
        assert!(!scorer.should_recall("👍"));
        assert!(!scorer.should_recall("!"));
        assert!(!scorer.should_recall(""));
    }

    #[test]
    fn past_tense_heuristic_triggers() {
        let scorer = TriggerScorer::new();
        // No explicit trigger word, but a past-tense verb.
        assert!(scorer.should_recall("sunucuyu kurmustuk"));
    }

    #[test]
    fn ambiguous_multiword_queries_trigger() {
        let scorer = TriggerScorer::new();
        assert!(scorer.should_recall("database connection pool size"));
    }

    #[test]
    fn decision_text_scores_high() {
        let scorer = TriggerScorer::new();
        let decision = scorer.score_importance(
            "We decided to use PostgreSQL for the primary store",
            Category::Fact,
            None,
        );
        let chatter = scorer.score_importance("nice weather huh", Category::Conversation, None);
        assert!(decision > chatter);
        assert!(decision >= 0.5);
    }

    #[test]
    fn rules_are_maximally_important() {
        let scorer = TriggerScorer::new();
        let score = scorer.score_importance("Never deploy on Fridays", Category::Rule, None);
        assert!((score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn cron_origin_is_capped() {
        let scorer = TriggerScorer::new();
        let score = scorer.score_importance(
            "We decided to use PostgreSQL for the primary store. Always use it.",
            Category::Fact,
            Some("openclaw-cron"),
        );
        assert!(score <= CRON_IMPORTANCE_CAP);
    }

    #[test]
    fn qa_pairs_get_a_bonus() {
        let scorer = TriggerScorer::new();
        let qa = scorer.score_importance("Q: where? A: Istanbul", Category::QaPair, None);
        let plain = scorer.score_importance("Q: where? A: Istanbul", Category::Fact, None);
        assert!(qa > plain);
    }
}
