//! Telemetry and logging infrastructure
//!
//! Structured logging with tracing and per-pipeline performance counters.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_default, LogConfig, LogGuard};
pub use metrics::{LatencyStats, LatencyTracker, ReceiverStats, SenderStats};
