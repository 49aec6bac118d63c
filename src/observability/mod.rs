//! Observability: structured logging and connectivity metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, ConnectivityMetrics, MetricsSnapshot};
