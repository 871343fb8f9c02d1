//! End-to-end recall scenarios: capture → recall roundtrips, degraded
//! modes, temporal filters, and cache behavior.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use agent_memory::config::MemoryConfig;
use agent_memory::models::{Category, ConfidenceTier, RecallRequest, SearchMode};
use agent_memory::write::StoreRequest;
use agent_memory::CoreContext;

const DIM: usize = 768;

fn open_core(dir: &tempfile::TempDir) -> CoreContext {
    let config = MemoryConfig {
        data_dir: dir.path().to_path_buf(),
        dimensions: DIM,
        ..MemoryConfig::default()
    };
    CoreContext::open(config).expect("core opens")
}

#[test]
fn ui_preference_is_recalled_top_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);

    core.store(&StoreRequest::new("User prefers dark mode"))
        .expect("store");
    core.store(&StoreRequest::new("The deploy pipeline uses blue-green rollout"))
        .expect("store");
    core.store(&StoreRequest::new("Coffee order: flat white, no sugar"))
        .expect("store");

    let response = core
        .recall(
            &RecallRequest::new("what is the user's UI preference, dark mode or light")
                .with_limit(1),
        )
        .expect("recall");

    assert_eq!(response.results.len(), 1);
    assert!(response.results[0].text.contains("dark mode"));
    assert!(
        response.results[0].confidence_tier >= ConfidenceTier::Medium,
        "expected MEDIUM or better, got {:?} at {:.3}",
        response.results[0].confidence_tier,
        response.results[0].score
    );
}

#[test]
fn duplicate_turkish_sentence_merges_to_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);

    let text = "geçen hafta yeni sunucu aldık";
    let first = core.store(&StoreRequest::new(text)).expect("first");
    let second = core.store(&StoreRequest::new(text)).expect("second");
    let third = core.store(&StoreRequest::new(text)).expect("third");
    assert_eq!(first.id, second.id);
    assert_eq!(first.id, third.id);

    let store = core.pool().get("main").expect("store");
    assert_eq!(store.count_live().expect("count"), 1);
    let row = store.get(&first.id).expect("get").expect("present");
    assert_eq!(row.reinforce_count, 2);
    assert!(row.strength >= 1.0 - f32::EPSILON);
}

#[test]
fn temporal_query_filters_to_the_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs();

    // Two deploy-error memories: one fresh, one far outside "yesterday".
    core.store(&StoreRequest::new("deploy errors in the auth service rollout"))
        .expect("store recent");
    // Backdate the old one by writing it directly.
    let store = core.pool().get("main").expect("store");
    let old_text = "deploy errors during the cache migration";
    let old = agent_memory::models::Memory::new(
        "main",
        old_text,
        old_text,
        Category::Fact,
        now - 30 * 86_400,
    );
    store.insert(&old).expect("insert old");

    let response = core
        .recall(&RecallRequest::new("yesterday's deploy errors"))
        .expect("recall");

    assert!(!response.results.is_empty());
    for result in &response.results {
        assert!(
            result.created_at >= now - 86_400 - 1,
            "result outside the temporal window: created_at={}",
            result.created_at
        );
    }
}

#[test]
fn vectorless_memory_is_still_lexically_retrievable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs();

    // One embedded memory and one vectorless (as if embedding failed).
    core.store(&StoreRequest::new("redis cluster failover runbook"))
        .expect("store");
    let store = core.pool().get("main").expect("store");
    let vectorless_text = "zookeeper quorum outage postmortem";
    let vectorless = agent_memory::models::Memory::new(
        "main",
        vectorless_text,
        vectorless_text,
        Category::Fact,
        now,
    );
    store.insert(&vectorless).expect("insert vectorless");
    assert_eq!(store.vectorless_count().expect("count"), 1);

    // The semantic layer still answers for others; the vectorless memory
    // surfaces through the lexical path.
    let response = core
        .recall(&RecallRequest::new("zookeeper quorum outage"))
        .expect("recall");
    assert!(response.results.iter().any(|r| r.id == vectorless.id));
    assert_eq!(response.search_mode, SearchMode::Full);
}

#[test]
fn repeated_query_hits_the_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);

    core.store(&StoreRequest::new("the api gateway rate limit is 120 per minute"))
        .expect("store");

    let request = RecallRequest::new("api gateway rate limit");
    let first = core.recall(&request).expect("first");
    assert!(!first.cached);
    let second = core.recall(&request).expect("second");
    assert!(second.cached);
    assert_eq!(first.results.len(), second.results.len());

    // A different min_score is a different cache entry.
    let other = core
        .recall(&RecallRequest::new("api gateway rate limit").with_min_score(0.9))
        .expect("other");
    assert!(!other.cached);
}

#[test]
fn all_scope_unions_agents_with_per_agent_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);

    core.store(&StoreRequest::new("build cluster token rotation steps").with_agent("main"))
        .expect("store main");
    core.store(&StoreRequest::new("build cluster disk expansion steps").with_agent("devops"))
        .expect("store devops");

    let response = core
        .recall(
            &RecallRequest::new("build cluster steps")
                .with_agent("all")
                .with_limit(10),
        )
        .expect("recall");

    let agents: std::collections::HashSet<&str> =
        response.results.iter().map(|r| r.agent.as_str()).collect();
    assert!(agents.contains("main"), "missing main results");
    assert!(agents.contains("devops"), "missing devops results");
}

#[test]
fn trigger_flag_reflects_query_shape() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);
    core.store(&StoreRequest::new("we decided to use postgres"))
        .expect("store");

    let triggered = core
        .recall(&RecallRequest::new("what did we decide about the database"))
        .expect("recall");
    assert!(triggered.triggered);
}

#[test]
fn forgotten_memories_never_come_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);

    let receipt = core
        .store(&StoreRequest::new("ephemeral scratchpad entry about parsers"))
        .expect("store");
    core.forget("main", Some(&receipt.id), None).expect("forget");

    let response = core
        .recall(&RecallRequest::new("ephemeral scratchpad parsers"))
        .expect("recall");
    assert!(response.results.iter().all(|r| r.id != receipt.id));
}

#[test]
fn oversized_query_is_a_validation_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open_core(&dir);
    let huge = "x".repeat(20_000);
    let err = core.recall(&RecallRequest::new(huge)).unwrap_err();
    assert_eq!(err.kind(), "validation");
}
