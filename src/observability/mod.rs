//! Observability: structured logging and the metrics hub.

pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, init as init_logging};
pub use metrics::{AgentStats, StatsSnapshot, install as install_metrics, render_prometheus, snapshot};
