use std::sync::Arc;

use spiketab::observability::{AnalysisMonitor, MetricsCollector};
use spiketab::{Analyzer, EventTrains, InMemoryRecording};

#[test]
fn test_monitor_report() {
    let collector = MetricsCollector::new();

    let waveforms = collector.for_extension("waveforms");
    let templates = collector.for_extension("templates");
    waveforms.finish_computation(waveforms.start_computation());
    waveforms.finish_computation(waveforms.start_computation());
    templates.finish_computation(templates.start_computation());
    templates.record_failure();

    let monitor = AnalysisMonitor::new("rec-1", collector);
    let report = monitor.generate_report();

    assert!(report.starts_with("=== Analysis rec-1 ==="));
    assert!(report.contains("[waveforms]"));
    assert!(report.contains("Computed: 2 times"));
    assert!(report.contains("Computed: 1 time\n"));
    assert!(report.contains("Failures: 1"));
}

#[test]
fn test_analyzer_feeds_monitor() {
    let recording = InMemoryRecording::new(1000.0, 1, vec![vec![0.5; 2000]]).unwrap();
    let analyzer = Analyzer::builder(Arc::new(recording), Arc::new(EventTrains::new(1)))
        .build()
        .unwrap();

    analyzer.get("noise_levels", None).unwrap();
    analyzer.get("noise_levels", None).unwrap();

    let report = analyzer.monitor().generate_report();
    assert!(report.contains("[noise_levels]"));
    assert!(report.contains("Computed: 1 time\n"));
    assert!(report.contains("Cache hits: 1"));
}
