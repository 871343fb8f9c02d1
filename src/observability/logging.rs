//! Structured logging initialization.

use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for interactive use.
    Pretty,
    /// One JSON object per line for collectors.
    Json,
}

impl LogFormat {
    /// Parses a format name; anything unrecognized is pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Installs the global tracing subscriber.
///
/// The filter honors `AGENT_MEMORY_LOG` (e.g. `agent_memory=debug`),
/// falling back to `RUST_LOG`, then to `info`. Repeat initialization is a
/// no-op so tests can call this freely.
pub fn init(format: LogFormat) {
    let filter = std::env::var("AGENT_MEMORY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map_or_else(|_| EnvFilter::new("info"), EnvFilter::new);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
