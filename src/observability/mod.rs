pub mod collector;
pub mod metrics;
pub mod monitor;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use metrics::ExtensionMetrics;
pub use monitor::AnalysisMonitor;
