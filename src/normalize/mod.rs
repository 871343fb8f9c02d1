//! Text normalization.
//!
//! A pure pipeline: ASCII folding, lowercasing, stopword pruning, optional
//! lemmatization through an injected capability, and temporal-phrase
//! extraction. The output feeds the lexical index, the write-dedup id
//! derivation, and recall-time temporal filters.
//!
//! Morphological analysis itself is an external concern: the [`Lemmatizer`]
//! trait is the seam, with a pass-through default and a conservative
//! suffix-stripping Turkish implementation.

mod temporal;

pub use temporal::{TemporalRef, extract_temporal_refs};

use crate::models::TimeRange;
use std::collections::HashSet;
use std::sync::Arc;

/// Capability interface for lemmatization.
pub trait Lemmatizer: Send + Sync {
    /// Reduces a folded, lowercased token to its lemma.
    fn lemma(&self, token: &str, language: Language) -> String;
}

/// Pass-through lemmatizer; English and unknown languages fall through
/// lowercased.
pub struct NullLemmatizer;

impl Lemmatizer for NullLemmatizer {
    fn lemma(&self, token: &str, _language: Language) -> String {
        token.to_string()
    }
}

/// Conservative suffix-stripping lemmatizer for Turkish.
///
/// Strips the most common plural and case suffixes when the remaining stem
/// keeps at least three characters; anything less aggressive than a real
/// morphological analyzer, but enough to make `sunucular` and `sunucu`
/// collide in the lexical index.
pub struct TurkishSuffixLemmatizer;

impl TurkishSuffixLemmatizer {
    /// Suffixes stripped in order, longest first.
    const SUFFIXES: [&'static str; 18] = [
        "lerin", "larin", "lere", "lara", "lerde", "larda", "lerden", "lardan", "ler", "lar",
        "den", "dan", "ten", "tan", "de", "da", "te", "ta",
    ];

    /// Minimum stem length kept after stripping.
    const MIN_STEM: usize = 3;
}

impl Lemmatizer for TurkishSuffixLemmatizer {
    fn lemma(&self, token: &str, language: Language) -> String {
        if language != Language::Turkish {
            return token.to_string();
        }
        for suffix in Self::SUFFIXES {
            if let Some(stem) = token.strip_suffix(suffix)
                && stem.chars().count() >= Self::MIN_STEM
            {
                return stem.to_string();
            }
        }
        token.to_string()
    }
}

/// Best-effort language guess used to pick lemmatization behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    /// Turkish text.
    Turkish,
    /// English (and fallback for anything unrecognized).
    English,
}

impl Language {
    /// Returns the guess as a two-letter code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Turkish => "tr",
            Self::English => "en",
        }
    }
}

/// Output of [`Normalizer::normalize`].
#[derive(Debug, Clone)]
pub struct Normalized {
    /// Stopword-pruned, lemmatized, folded text (token join).
    pub text: String,
    /// Individual normalized tokens.
    pub tokens: Vec<String>,
    /// ASCII-folded, lowercased form of the raw input.
    pub folded: String,
    /// Language guess.
    pub language: Language,
    /// Absolute time windows extracted from temporal phrases.
    pub temporal_refs: Vec<TimeRange>,
}

/// Folds Turkish diacritics to their ASCII base and lowercases.
///
/// Both the folded and original forms end up searchable because the store
/// indexes the folded text while BM25 trigram matching is substring-based.
#[must_use]
pub fn ascii_fold(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ç' | 'Ç' => 'c',
            'ğ' | 'Ğ' => 'g',
            'ı' | 'I' => 'i',
            'İ' => 'i',
            'ö' | 'Ö' => 'o',
            'ş' | 'Ş' => 's',
            'ü' | 'Ü' => 'u',
            _ => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Default Turkish stopwords (folded forms).
const TURKISH_STOPWORDS: [&str; 24] = [
    "ve", "ile", "de", "da", "ki", "bu", "su", "o", "bir", "icin", "gibi", "ama", "fakat", "ya",
    "hem", "ne", "mi", "mu", "daha", "cok", "en", "her", "sey", "ben",
];

/// Default English stopwords.
const ENGLISH_STOPWORDS: [&str; 28] = [
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "to", "of",
    "in", "on", "at", "for", "with", "by", "from", "as", "it", "this", "that", "i", "you", "we",
];

/// Turkish-specific characters used for the language guess.
const TURKISH_MARKERS: [char; 9] = ['ç', 'ğ', 'ı', 'ö', 'ş', 'ü', 'Ç', 'Ğ', 'Ş'];

/// Pure text-normalization pipeline.
pub struct Normalizer {
    stopwords: HashSet<String>,
    lemmatizer: Arc<dyn Lemmatizer>,
}

impl Normalizer {
    /// Creates a normalizer with the default stopword set and Turkish
    /// suffix lemmatizer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lemmatizer(Arc::new(TurkishSuffixLemmatizer))
    }

    /// Creates a normalizer with an injected lemmatizer capability.
    #[must_use]
    pub fn with_lemmatizer(lemmatizer: Arc<dyn Lemmatizer>) -> Self {
        let stopwords = TURKISH_STOPWORDS
            .iter()
            .chain(ENGLISH_STOPWORDS.iter())
            .map(|s| (*s).to_string())
            .collect();
        Self {
            stopwords,
            lemmatizer,
        }
    }

    /// Replaces the stopword set.
    #[must_use]
    pub fn with_stopwords<I, S>(mut self, stopwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stopwords = stopwords.into_iter().map(Into::into).collect();
        self
    }

    /// Guesses the language of raw input.
    #[must_use]
    pub fn guess_language(raw: &str) -> Language {
        if raw.chars().any(|c| TURKISH_MARKERS.contains(&c)) {
            return Language::Turkish;
        }
        let folded = ascii_fold(raw);
        let turkish_hits = folded
            .split_whitespace()
            .filter(|w| TURKISH_STOPWORDS.contains(w))
            .count();
        if turkish_hits >= 2 {
            Language::Turkish
        } else {
            Language::English
        }
    }

    /// Normalizes raw text.
    ///
    /// `now` anchors temporal phrases ("yesterday", "geçen hafta") to
    /// absolute windows.
    #[must_use]
    pub fn normalize(&self, raw: &str, now: u64) -> Normalized {
        let language = Self::guess_language(raw);
        let folded = ascii_fold(raw);
        let temporal_refs = extract_temporal_refs(&folded, now)
            .into_iter()
            .map(|r| r.range)
            .collect();

        let tokens: Vec<String> = folded
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .filter(|t| !self.stopwords.contains(*t))
            .map(|t| self.lemmatizer.lemma(t, language))
            .collect();

        Normalized {
            text: tokens.join(" "),
            tokens,
            folded,
            language,
            temporal_refs,
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}
