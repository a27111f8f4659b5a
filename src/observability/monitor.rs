use super::MetricsCollector;

pub struct AnalysisMonitor {
    identity: String,
    collector: MetricsCollector,
}

impl AnalysisMonitor {
    pub fn new(identity: impl Into<String>, collector: MetricsCollector) -> Self {
        Self {
            identity: identity.into(),
            collector,
        }
    }

    pub fn generate_report(&self) -> String {
        let snapshot = self.collector.snapshot();

        if snapshot.is_empty() {
            return format!("No extensions requested on analysis {}", self.identity);
        }

        let mut report = format!("=== Analysis {} ===\n", self.identity);

        for (name, metrics) in snapshot.iter() {
            report.push_str(&format!(
                "\n[{}]\n  Computed: {} time{}\n  Cache hits: {}\n  Failures: {}\n  Invalidated: {}\n  Chunks: {}\n  Avg Latency: {}μs\n",
                name,
                metrics.computations,
                if metrics.computations == 1 { "" } else { "s" },
                metrics.cache_hits,
                metrics.failures,
                metrics.invalidations,
                metrics.chunks_processed,
                metrics.avg_latency_us
            ));
        }

        report
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }
}
