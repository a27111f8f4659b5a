use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one extension within one analysis.
pub struct ExtensionMetrics {
    extension: String,
    computations: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    invalidations: AtomicU64,
    chunks_processed: AtomicU64,
    total_latency_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl ExtensionMetrics {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            computations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            chunks_processed: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Number of times the computation itself ran.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn chunks_processed(&self) -> u64 {
        self.chunks_processed.load(Ordering::Relaxed)
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_computation(&self) -> Instant {
        self.computations.fetch_add(1, Ordering::Relaxed);
        Instant::now()
    }

    pub fn finish_computation(&self, start: Instant) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_us(&self) -> u64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / samples
    }
}
