use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::json;
use spiketab_macros::ExtensionParams;

use super::ms_to_samples;
use crate::engine::ChunkJob;
use crate::error::EngineError;
use crate::extension::{ComputeContext, ExtensionData, NdArray};
use crate::registry::{BuiltinExtension, ExtensionDescriptor};

pub const NAME: &str = "waveforms";

#[derive(Debug, Clone, Deserialize, ExtensionParams)]
pub struct WaveformsParams {
    #[param(default = "1.0", min = 0.0)]
    pub ms_before: f64,
    #[param(default = "2.0", min = 0.0)]
    pub ms_after: f64,
    #[param(default = "500", min = 1.0)]
    pub max_spikes_per_unit: usize,
    #[param(default = "0", min = 0.0)]
    pub seed: u64,
}

pub fn descriptor() -> ExtensionDescriptor {
    ExtensionDescriptor::new(NAME)
        .with_params::<WaveformsParams>()
        .with_compute(compute)
}

inventory::submit! {
    BuiltinExtension { order: 20, factory: descriptor }
}

/// Array key holding the snippets of one unit, `[spikes, samples, channels]`.
pub fn waveforms_key(unit_id: &str) -> String {
    format!("waveforms/{unit_id}")
}

/// Array key holding `(segment, sample)` of every extracted spike of a unit.
pub fn spikes_key(unit_id: &str) -> String {
    format!("spikes/{unit_id}")
}

#[derive(Debug, Clone, Copy)]
struct Selected {
    segment: usize,
    sample: usize,
    unit: usize,
    slot: usize,
}

/// Snippets around each unit's events, at most `max_spikes_per_unit` per
/// unit. Events whose window would leave the segment are skipped.
fn compute(ctx: &ComputeContext<'_>) -> anyhow::Result<ExtensionData> {
    let params: WaveformsParams = ctx.decode_params()?;
    let recording = ctx.recording();
    let events = ctx.events();
    let num_channels = recording.num_channels();

    let nbefore = ms_to_samples(params.ms_before, recording.sampling_rate());
    let nafter = ms_to_samples(params.ms_after, recording.sampling_rate());
    let nsamples = nbefore + nafter;
    if nsamples == 0 {
        anyhow::bail!(EngineError::InvalidParameter {
            extension: NAME.to_string(),
            parameter: "ms_before".to_string(),
            reason: "ms_before + ms_after must span at least one sample".to_string(),
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut selected = Vec::new();
    let mut counts = vec![0usize; events.num_units()];
    for unit in 0..events.num_units() {
        let mut candidates = Vec::new();
        for segment in 0..events.num_segments() {
            let len = recording.num_samples(segment)?;
            candidates.extend(
                events
                    .segment_events(unit, segment)
                    .iter()
                    .filter(|&&s| s >= nbefore && s + nafter <= len)
                    .map(|&s| (segment, s)),
            );
        }
        if candidates.len() > params.max_spikes_per_unit {
            let mut keep = rand::seq::index::sample(
                &mut rng,
                candidates.len(),
                params.max_spikes_per_unit,
            )
            .into_vec();
            keep.sort_unstable();
            candidates = keep.into_iter().map(|i| candidates[i]).collect();
        }
        counts[unit] = candidates.len();
        selected.extend(
            candidates
                .into_iter()
                .enumerate()
                .map(|(slot, (segment, sample))| Selected {
                    segment,
                    sample,
                    unit,
                    slot,
                }),
        );
    }
    selected.sort_by_key(|s| (s.segment, s.sample, s.unit));

    let snippet_len = nsamples * num_channels;
    let job = ChunkJob::new().margin(nbefore.max(nafter));
    let mut arrays: Vec<NdArray> = counts
        .iter()
        .map(|&n| NdArray::zeros(vec![n, nsamples, num_channels]))
        .collect();

    let partials = ctx.executor().run(
        recording,
        &job,
        |traces, meta| {
            let chunk = meta.chunk;
            let lo = selected
                .partition_point(|s| (s.segment, s.sample) < (chunk.segment_index, chunk.start));
            let hi = selected
                .partition_point(|s| (s.segment, s.sample) < (chunk.segment_index, chunk.end));
            let mut snippets = Vec::with_capacity(hi - lo);
            for spike in &selected[lo..hi] {
                let offset = spike.sample - nbefore - meta.traces_start();
                let rows = traces.rows(offset, offset + nsamples);
                let snippet: Vec<f64> = rows.iter().map(|&v| f64::from(v)).collect();
                snippets.push((spike.unit, spike.slot, snippet));
            }
            Ok(snippets)
        },
        |partials| partials.into_iter().flatten().collect::<Vec<_>>(),
    )?;

    for (unit, slot, snippet) in partials {
        let start = slot * snippet_len;
        arrays[unit].data_mut()[start..start + snippet_len].copy_from_slice(&snippet);
    }

    let unit_ids: Vec<&str> = events.unit_ids().collect();
    let mut data = ExtensionData::new()
        .with_attr("nbefore", json!(nbefore))
        .with_attr("nafter", json!(nafter))
        .with_attr("sampling_rate", json!(recording.sampling_rate()))
        .with_attr("unit_ids", json!(unit_ids));

    let mut positions: Vec<Vec<f64>> = counts.iter().map(|&n| vec![0.0; n * 2]).collect();
    for s in &selected {
        positions[s.unit][s.slot * 2] = s.segment as f64;
        positions[s.unit][s.slot * 2 + 1] = s.sample as f64;
    }
    for ((unit_id, array), (count, position)) in unit_ids
        .iter()
        .zip(arrays)
        .zip(counts.iter().zip(positions))
    {
        data.insert_array(waveforms_key(unit_id), array);
        data.insert_array(
            spikes_key(unit_id),
            NdArray::new(vec![*count, 2], position).context("spike positions")?,
        );
    }
    Ok(data)
}
