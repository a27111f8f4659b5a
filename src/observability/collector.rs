use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::ExtensionMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub extension: String,
    pub computations: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub invalidations: u64,
    pub chunks_processed: u64,
    pub avg_latency_us: u64,
}

/// Per-extension metrics of one analysis, created on first use.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<BTreeMap<String, Arc<ExtensionMetrics>>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for `extension`, registering them if needed.
    pub fn for_extension(&self, extension: &str) -> Arc<ExtensionMetrics> {
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        metrics
            .entry(extension.to_string())
            .or_insert_with(|| Arc::new(ExtensionMetrics::new(extension)))
            .clone()
    }

    pub fn get(&self, extension: &str) -> Option<Arc<ExtensionMetrics>> {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(extension)
            .cloned()
    }

    /// Computation count for `extension`, zero when it never ran.
    pub fn computations(&self, extension: &str) -> u64 {
        self.get(extension).map(|m| m.computations()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, m)| {
                (
                    name.clone(),
                    MetricsSnapshot {
                        extension: m.extension().to_string(),
                        computations: m.computations(),
                        cache_hits: m.cache_hits(),
                        failures: m.failures(),
                        invalidations: m.invalidations(),
                        chunks_processed: m.chunks_processed(),
                        avg_latency_us: m.avg_latency_us(),
                    },
                )
            })
            .collect()
    }
}
