use spiketab::observability::ExtensionMetrics;
use std::sync::Arc;

#[test]
fn test_metrics_creation() {
    let metrics = ExtensionMetrics::new("templates");
    assert_eq!(metrics.extension(), "templates");
    assert_eq!(metrics.computations(), 0);
    assert_eq!(metrics.failures(), 0);
    assert_eq!(metrics.avg_latency_us(), 0);
}

#[test]
fn test_metrics_increment() {
    let metrics = Arc::new(ExtensionMetrics::new("templates"));

    metrics.record_cache_hit();
    metrics.record_cache_hit();
    assert_eq!(metrics.cache_hits(), 2);

    metrics.record_failure();
    metrics.record_invalidation();
    metrics.record_chunk();
    assert_eq!(metrics.failures(), 1);
    assert_eq!(metrics.invalidations(), 1);
    assert_eq!(metrics.chunks_processed(), 1);
}

#[tokio::test]
async fn test_metrics_latency_tracking() {
    let metrics = ExtensionMetrics::new("waveforms");

    let start = metrics.start_computation();
    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    metrics.finish_computation(start);

    assert_eq!(metrics.computations(), 1);
    assert!(metrics.avg_latency_us() >= 10_000);
}
