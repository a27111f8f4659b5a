use std::f32::consts::PI;
use std::sync::Arc;

use serde_json::json;
use spiketab::{
    AnalysisPool, Analyzer, EngineConfig, EventTrains, ExtensionRegistry, InMemoryRecording,
};

/// Two units firing on four channels of a noisy two-segment recording.
fn synthetic(seed_phase: f32) -> anyhow::Result<(InMemoryRecording, EventTrains)> {
    let rate = 10_000.0;
    let len = 20_000;
    let unit_a: Vec<usize> = (200..len - 200).step_by(450).collect();
    let unit_b: Vec<usize> = (300..len - 200).step_by(700).collect();

    let mut segments = Vec::new();
    for segment in 0..2 {
        let mut channels = vec![vec![0.0f32; len]; 4];
        for (c, channel) in channels.iter_mut().enumerate() {
            for (i, v) in channel.iter_mut().enumerate() {
                *v = 0.3 * ((i as f32 * 0.37 + c as f32 + seed_phase + segment as f32) * PI).sin();
            }
        }
        for (spikes, peak, amp) in [(&unit_a, 0usize, 5.0f32), (&unit_b, 3usize, 8.0f32)] {
            for &s in spikes {
                for t in 0..10 {
                    channels[peak][s + t] -= amp * (1.0 - t as f32 / 10.0);
                }
            }
        }
        segments.push(channels);
    }

    let recording = InMemoryRecording::from_channels(rate, segments)?;
    let in_both_segments = |spikes: &[usize]| -> Vec<(usize, usize)> {
        (0..2)
            .flat_map(move |segment| spikes.iter().map(move |&s| (segment, s)))
            .collect()
    };
    let events = EventTrains::from_units(
        2,
        [("a", in_both_segments(&unit_a)), ("b", in_both_segments(&unit_b))],
    )?;
    Ok((recording, events))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spiketab::logging::init();

    let config = EngineConfig::from_env()?;
    let registry = ExtensionRegistry::global();
    println!("Registered extensions: {}", registry.names().join(", "));

    let mut analyzers = Vec::new();
    for phase in [0.0f32, 0.5] {
        let (recording, events) = synthetic(phase)?;
        let analyzer = Analyzer::builder(Arc::new(recording), Arc::new(events))
            .config(config.clone())
            .registry(registry.clone())
            .build()?;
        analyzers.push(Arc::new(analyzer));
    }

    let pool = AnalysisPool::new(2);
    let requests = analyzers
        .iter()
        .map(|a| (a.clone(), "sparsity".to_string()))
        .collect();
    for result in pool.get_all(requests).await {
        let sparsity = result?;
        if let Some(mask) = sparsity.array("mask") {
            println!("sparsity mask {:?}: {:?}", mask.shape(), mask.data());
        }
    }

    let first = &analyzers[0];
    first.get("templates", Some(&json!({"mode": "median"})))?;
    first.get("sparsity", None)?;
    first.get("noise_levels", None)?;
    println!("Computed: {}", first.computed_extensions()?.join(", "));
    println!("\n{}", first.monitor().generate_report());

    Ok(())
}
