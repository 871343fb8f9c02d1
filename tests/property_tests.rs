//! Property-based tests for the numerical and structural invariants.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use agent_memory::config::LifecycleConfig;
use agent_memory::embedding::{Embedder, HashedEmbedder};
use agent_memory::lifecycle::LifecycleService;
use agent_memory::models::{Category, Memory, MemoryFilter, MemoryId};
use agent_memory::normalize::Normalizer;
use agent_memory::storage::{MergeOutcome, Store, StoragePool, cosine_similarity};
use proptest::prelude::*;
use std::sync::Arc;

const DIM: usize = 768;
const DAY: u64 = 86_400;

fn text_strategy() -> impl Strategy<Value = String> {
    // Lowercase word salads: enough variety for distinct ids, no
    // normalization surprises.
    prop::collection::vec("[a-z]{3,10}", 3..12).prop_map(|words| words.join(" "))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Identical normalized text and agent always derive the same id;
    /// different agents never share it.
    #[test]
    fn memory_id_derivation_is_stable(text in text_strategy()) {
        let a = MemoryId::derive("main", &text);
        let b = MemoryId::derive("main", &text);
        let other = MemoryId::derive("secondary", &text);
        prop_assert_eq!(a.clone(), b);
        prop_assert_ne!(a, other);
    }

    /// Normalization is deterministic and its output is ASCII-foldable
    /// text only.
    #[test]
    fn normalization_is_deterministic(text in "[a-zA-ZçğıöşüÇĞİÖŞÜ ]{1,80}") {
        let normalizer = Normalizer::new();
        let first = normalizer.normalize(&text, 0);
        let second = normalizer.normalize(&text, 0);
        prop_assert_eq!(&first.text, &second.text);
        prop_assert!(first.folded.chars().all(|c| c.is_ascii() || !c.is_alphanumeric()));
    }

    /// Decay follows the Ebbinghaus curve within floating-point tolerance
    /// and never leaves the [0, 1] band.
    #[test]
    fn decay_matches_formula(
        importance in 0.0_f32..=1.0,
        dt_days in 1_u64..400,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = Arc::new(StoragePool::new(dir.path(), DIM).expect("pool"));
        let store = pool.get("main").expect("store");
        let created = 1_000_000_u64;
        let memory = Memory::new("main", "subject", "subject", Category::Fact, created)
            .with_importance(importance);
        store.insert(&memory).expect("insert");

        let config = LifecycleConfig::default();
        let lifecycle = LifecycleService::new(
            Arc::clone(&pool),
            Arc::new(HashedEmbedder::new(DIM)),
            config,
        );
        lifecycle.decay("main", created + dt_days * DAY).expect("decay");

        #[allow(clippy::cast_precision_loss)]
        let expected = (-(dt_days as f32) * config.decay_base_rate
            / (1.0 + config.decay_alpha * memory.importance))
            .exp();
        let row = store.get(&memory.id).expect("get").expect("present");
        prop_assert!((row.strength - expected).abs() < 1e-4);
        prop_assert!((0.0..=1.0).contains(&row.strength));
    }

    /// Export then import preserves id, text, category, importance,
    /// pinned, and created_at for arbitrary records.
    #[test]
    fn export_import_roundtrip(
        text in text_strategy(),
        importance in 0.0_f32..=1.0,
        pinned in any::<bool>(),
        created_at in 1_u64..2_000_000_000,
    ) {
        let source = Store::in_memory("main", DIM).expect("store");
        let memory = Memory::new("main", &text, &text, Category::Preference, created_at)
            .with_importance(importance)
            .with_pinned(pinned);
        source.insert(&memory).expect("insert");

        let exported = source.export(&MemoryFilter::new()).expect("export");
        let target = Store::in_memory("main", DIM).expect("store");
        let stats = target.import(&exported).expect("import");
        prop_assert_eq!(stats.imported, 1);

        let restored = target.get(&memory.id).expect("get").expect("present");
        prop_assert_eq!(restored.text, memory.text);
        prop_assert_eq!(restored.category, memory.category);
        prop_assert!((restored.importance - memory.importance).abs() < 1e-6);
        prop_assert_eq!(restored.pinned, memory.pinned);
        prop_assert_eq!(restored.created_at, memory.created_at);
    }

    /// Cosine similarity is symmetric and bounded.
    #[test]
    fn cosine_similarity_properties(
        a in prop::collection::vec(-1.0_f32..=1.0, 8),
        b in prop::collection::vec(-1.0_f32..=1.0, 8),
    ) {
        let ab = cosine_similarity(&a, &b);
        let ba = cosine_similarity(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-6);
        prop_assert!((0.0..=1.0).contains(&ab));
        let aa = cosine_similarity(&a, &a);
        prop_assert!(aa == 0.0 || aa > 0.99);
    }
}

/// For any pair of texts whose embeddings sit at or above the merge
/// threshold, inserting both leaves exactly one live record, reinforced,
/// with strength no lower than either input.
#[test]
fn merge_invariant_for_similar_pairs() {
    let embedder = HashedEmbedder::new(DIM);
    let pairs = [
        (
            "the builds are cached on the shared runner volume",
            "builds are cached on the shared runner volume too",
        ),
        (
            "postgres backups run nightly at three",
            "the postgres backups run nightly at three",
        ),
    ];

    for (first_text, second_text) in pairs {
        let store = Store::in_memory("main", DIM).expect("store");
        let first = Memory::new("main", first_text, first_text, Category::Fact, 1_000)
            .with_embedding(embedder.embed(first_text).expect("embed"));
        let second = Memory::new("main", second_text, second_text, Category::Fact, 2_000)
            .with_embedding(embedder.embed(second_text).expect("embed"));

        let similarity = cosine_similarity(
            first.embedding.as_deref().unwrap(),
            second.embedding.as_deref().unwrap(),
        );

        store
            .merge_insert(&first, 0.85, 0.1, 1_000, &|_| false)
            .expect("first insert");
        let outcome = store
            .merge_insert(&second, 0.85, 0.1, 2_000, &|_| false)
            .expect("second insert");

        if similarity >= 0.85 {
            assert!(
                matches!(outcome, MergeOutcome::Reinforced { .. }),
                "similar pair (cos={similarity:.3}) must reinforce"
            );
            assert_eq!(store.count_live().expect("count"), 1);
            let survivor = store.get(&first.id).expect("get").expect("present");
            assert!(survivor.reinforce_count >= 1);
            assert!(
                survivor.strength >= first.strength.max(second.strength) - 1e-6,
                "reinforced strength must not drop below either input"
            );
        } else {
            assert_eq!(store.count_live().expect("count"), 2);
        }
    }
}

/// Pinned memories survive every maintenance loop untouched.
#[test]
fn pinned_memories_survive_all_maintenance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = Arc::new(StoragePool::new(dir.path(), DIM).expect("pool"));
    let embedder = HashedEmbedder::new(DIM);
    let store = pool.get("main").expect("store");
    let now = 5_000 * DAY;

    let text = "pinned cornerstone memory about deploy policy";
    let mut pinned = Memory::new("main", text, text, Category::Rule, now - 1_000 * DAY)
        .with_pinned(true)
        .with_embedding(embedder.embed(text).expect("embed"));
    pinned.strength = 0.05; // weak enough that GC would otherwise take it
    pinned.last_accessed_at = now - 1_000 * DAY;
    store.insert(&pinned).expect("insert");

    // A near-duplicate that consolidation would merge with it.
    let dup_text = "pinned cornerstone memory about the deploy policy";
    let dup = Memory::new("main", dup_text, dup_text, Category::Rule, now)
        .with_embedding(embedder.embed(dup_text).expect("embed"));
    store.insert(&dup).expect("insert");

    let lifecycle = LifecycleService::new(
        Arc::clone(&pool),
        Arc::new(HashedEmbedder::new(DIM)),
        LifecycleConfig::default(),
    );
    lifecycle.decay("main", now).expect("decay");
    lifecycle.consolidate("main", now).expect("consolidate");
    lifecycle.gc("main", now).expect("gc");

    let row = store.get(&pinned.id).expect("get").expect("present");
    assert!(row.is_live(), "pinned memory must never be soft-deleted");
    assert!(
        (row.strength - 0.05).abs() < f32::EPSILON,
        "pinned strength must never move"
    );
    assert!(row.superseded_by.is_none());
}
