//! Binary entry point for agent-memory.
//!
//! The HTTP surface lives in a separate adapter; this binary exposes the
//! core operations directly for shells and cron: store, recall, capture,
//! maintenance triggers, backup, and stats.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// CLI output goes to stdout/stderr by design.
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use agent_memory::config::MemoryConfig;
use agent_memory::models::{Category, MemoryFilter, MemoryId, RecallRequest};
use agent_memory::observability::{self, LogFormat};
use agent_memory::write::{CaptureMessage, StoreRequest};
use agent_memory::{CoreContext, Error};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// agent-memory - persistent local-first memory for conversational agents.
#[derive(Parser)]
#[command(name = "agent-memory")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Agent scope; `all` fans out for reads and maintenance.
    #[arg(short, long, global = true, default_value = "main")]
    agent: String,

    /// Path to a JSON overlay configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Store a single memory.
    Store {
        /// The text to remember.
        text: String,

        /// Category: qa_pair, user, assistant, fact, preference, rule,
        /// conversation.
        #[arg(short = 't', long, default_value = "fact")]
        category: String,

        /// Namespace partition.
        #[arg(short, long)]
        namespace: Option<String>,

        /// Source tag (cron-ish sources get capped importance).
        #[arg(short, long)]
        source: Option<String>,

        /// Explicit importance in [0, 1].
        #[arg(short, long)]
        importance: Option<f32>,
    },

    /// Store a standing rule (pinned, importance 1.0).
    Rule {
        /// The rule text.
        text: String,
    },

    /// Batch-capture session messages from a JSON file
    /// (`[{"role": "user", "text": "..."}, ...]`).
    Capture {
        /// Path to the messages file; `-` reads stdin.
        file: PathBuf,

        /// Session tag attached to every stored memory.
        #[arg(short, long)]
        session: Option<String>,

        /// Source tag.
        #[arg(long)]
        source: Option<String>,
    },

    /// Recall memories for a query.
    Recall {
        /// The free-text query.
        query: String,

        /// Maximum results.
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Namespace partition.
        #[arg(short, long)]
        namespace: Option<String>,

        /// Drop results below this final score.
        #[arg(long)]
        min_score: Option<f32>,
    },

    /// Forget a memory by id or by top recall hit.
    Forget {
        /// Memory id.
        #[arg(long)]
        id: Option<String>,

        /// Query; the top hit is forgotten.
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Pin a memory, exempting it from lifecycle attrition.
    Pin {
        /// Memory id.
        id: String,
    },

    /// Unpin a memory; decay resumes from its current strength.
    Unpin {
        /// Memory id.
        id: String,
    },

    /// Run an Ebbinghaus decay tick.
    Decay,

    /// Run a consolidation pass.
    Consolidate,

    /// Run garbage collection (soft-delete + hard purge).
    Gc,

    /// Retry embedding for vectorless memories.
    BackfillEmbeddings {
        /// Maximum memories per store.
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Check recall coverage for a list of topics.
    AmnesiaCheck {
        /// Topics to probe.
        #[arg(required = true)]
        topics: Vec<String>,
    },

    /// Export memories as JSON to stdout.
    Export {
        /// Include soft-deleted records.
        #[arg(long)]
        include_soft_deleted: bool,
    },

    /// Import a JSON backup (idempotent by id).
    Import {
        /// Path to the backup file; `-` reads stdin.
        file: PathBuf,
    },

    /// Print store statistics.
    Stats {
        /// Print the Prometheus text exposition instead of JSON.
        #[arg(long)]
        prometheus: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    observability::init_logging(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        },
    }
}

fn load_config(overlay: Option<&PathBuf>) -> Result<MemoryConfig, Error> {
    let config = match overlay {
        Some(path) => MemoryConfig::from_env_with_overlay(path)?,
        None => MemoryConfig::from_env()?,
    };

    // A remote embedder explicitly configured without its key is a startup
    // failure, not a silent fallback to the offline embedder.
    let explicit_remote = std::env::var("AGENT_MEMORY_EMBED_BASE_URL")
        .or_else(|_| std::env::var("ASUMAN_MEMORY_EMBED_BASE_URL"))
        .is_ok();
    if explicit_remote && config.embed.api_key.is_none() {
        return Err(Error::MissingSecret(
            "AGENT_MEMORY_EMBED_API_KEY (remote embedder configured)".to_string(),
        ));
    }

    Ok(config)
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, Error> {
    let raw = if path.as_os_str() == "-" {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| Error::Validation(format!("cannot read stdin: {e}")))?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| Error::Validation(format!("cannot read {}: {e}", path.display())))?
    };
    serde_json::from_str(&raw).map_err(|e| Error::Validation(format!("malformed JSON: {e}")))
}

#[allow(clippy::too_many_lines)]
fn run(cli: Cli) -> Result<(), Error> {
    let config = load_config(cli.config.as_ref())?;
    observability::install_metrics()?;
    let core = CoreContext::open(config)?;
    let agent = cli.agent;

    match cli.command {
        Commands::Store {
            text,
            category,
            namespace,
            source,
            importance,
        } => {
            let mut request = StoreRequest::new(text)
                .with_agent(agent.as_str())
                .with_category(Category::parse(&category));
            request.namespace = namespace;
            request.source = source;
            request.importance = importance;
            let receipt = core.store(&request)?;
            println!(
                "{}",
                serde_json::json!({
                    "id": receipt.id.as_str(),
                    "agent": receipt.agent,
                    "outcome": format!("{:?}", receipt.outcome),
                })
            );
        },

        Commands::Rule { text } => {
            let receipt = core.store_rule(&agent, &text)?;
            println!("stored rule {}", receipt.id);
        },

        Commands::Capture {
            file,
            session,
            source,
        } => {
            #[derive(serde::Deserialize)]
            struct RawMessage {
                role: String,
                text: String,
            }
            let raw: Vec<RawMessage> = read_json_file(&file)?;
            let messages: Vec<CaptureMessage> = raw
                .into_iter()
                .map(|m| CaptureMessage {
                    role: m.role,
                    text: m.text,
                })
                .collect();
            let receipts =
                core.capture(&agent, &messages, session.as_deref(), source.as_deref())?;
            println!("captured {} memories", receipts.len());
        },

        Commands::Recall {
            query,
            limit,
            namespace,
            min_score,
        } => {
            let mut filter = MemoryFilter::new();
            if let Some(ns) = namespace {
                filter = filter.with_namespace(ns);
            }
            let mut request = RecallRequest::new(query)
                .with_agent(agent.as_str())
                .with_limit(limit)
                .with_filter(filter);
            request.min_score = min_score;
            let response = core.recall(&request)?;

            for result in &response.results {
                println!(
                    "{:.3}  [{}]  {}  {}",
                    result.score,
                    result.confidence_tier.as_str(),
                    result.id,
                    result.text.lines().next().unwrap_or_default()
                );
            }
            eprintln!(
                "mode={} triggered={} degraded={} cached={} took={}ms",
                response.search_mode,
                response.triggered,
                response.degraded,
                response.cached,
                response.execution_time_ms
            );
        },

        Commands::Forget { id, query } => {
            let id = id.map(MemoryId::new);
            match core.forget(&agent, id.as_ref(), query.as_deref())? {
                Some(forgotten) => println!("forgot {forgotten}"),
                None => println!("nothing matched"),
            }
        },

        Commands::Pin { id } => {
            core.pin(&agent, &MemoryId::new(id))?;
            println!("pinned");
        },

        Commands::Unpin { id } => {
            core.unpin(&agent, &MemoryId::new(id))?;
            println!("unpinned");
        },

        Commands::Decay => {
            let stats = core.decay(&agent)?;
            println!(
                "examined={} decayed={} errors={}",
                stats.examined, stats.decayed, stats.errors
            );
        },

        Commands::Consolidate => {
            let stats = core.consolidate(&agent)?;
            println!(
                "examined={} clusters={} merged={} superseded={} ambiguous={}",
                stats.examined, stats.clusters, stats.merged, stats.superseded, stats.ambiguous
            );
        },

        Commands::Gc => {
            let stats = core.gc(&agent)?;
            println!(
                "soft_deleted={} purged={} errors={}",
                stats.soft_deleted, stats.purged, stats.errors
            );
        },

        Commands::BackfillEmbeddings { limit } => {
            let stats = core.backfill_embeddings(&agent, limit)?;
            println!(
                "examined={} embedded={} failed={}",
                stats.examined, stats.embedded, stats.failed
            );
        },

        Commands::AmnesiaCheck { topics } => {
            let report = core.amnesia_check(&agent, &topics)?;
            let lost: Vec<&str> = report
                .iter()
                .filter(|t| !t.covered)
                .map(|t| t.topic.as_str())
                .collect();
            for coverage in &report {
                println!(
                    "{}  covered={} best_score={:.3}",
                    coverage.topic, coverage.covered, coverage.best_score
                );
            }
            if !lost.is_empty() {
                eprintln!("possible amnesia: {}", lost.join(", "));
            }
        },

        Commands::Export {
            include_soft_deleted,
        } => {
            let mut filter = MemoryFilter::new();
            if include_soft_deleted {
                filter = filter.with_soft_deleted();
            }
            let records = core.export(&agent, &filter)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&records)
                    .map_err(|e| Error::Validation(format!("serialize failed: {e}")))?
            );
        },

        Commands::Import { file } => {
            let records: Vec<agent_memory::models::Memory> = read_json_file(&file)?;
            let stats = core.import(&agent, &records)?;
            println!("imported={} skipped={}", stats.imported, stats.skipped);
        },

        Commands::Stats { prometheus } => {
            if prometheus {
                print!("{}", observability::render_prometheus());
            } else {
                let snapshot = core.stats()?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshot)
                        .map_err(|e| Error::Validation(format!("serialize failed: {e}")))?
                );
            }
        },
    }

    Ok(())
}
