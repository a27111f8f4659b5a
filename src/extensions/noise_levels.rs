use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::json;
use spiketab_macros::ExtensionParams;

use super::median;
use crate::extension::{ComputeContext, ExtensionData, NdArray};
use crate::registry::{BuiltinExtension, ExtensionDescriptor};

pub const NAME: &str = "noise_levels";

/// Scale turning a median absolute deviation into a gaussian sigma.
const MAD_SCALE: f64 = 0.674_489_750_196_081_7;

#[derive(Debug, Clone, Deserialize, ExtensionParams)]
pub struct NoiseLevelsParams {
    #[param(default = "20", min = 1.0)]
    pub num_chunks_per_segment: usize,
    #[param(default = "10000", min = 1.0)]
    pub chunk_size: usize,
    #[param(default = "0", min = 0.0)]
    pub seed: u64,
}

pub fn descriptor() -> ExtensionDescriptor {
    ExtensionDescriptor::new(NAME)
        .with_params::<NoiseLevelsParams>()
        .with_compute(compute)
}

inventory::submit! {
    BuiltinExtension { order: 10, factory: descriptor }
}

/// Per-channel noise estimate from randomly placed chunks of every segment.
fn compute(ctx: &ComputeContext<'_>) -> anyhow::Result<ExtensionData> {
    let params: NoiseLevelsParams = ctx.decode_params()?;
    let recording = ctx.recording();
    let num_channels = recording.num_channels();

    let mut per_channel: Vec<Vec<f64>> = vec![Vec::new(); num_channels];
    for segment in 0..recording.num_segments() {
        let num_samples = recording.num_samples(segment)?;
        if num_samples == 0 {
            continue;
        }
        let chunk_size = params.chunk_size.min(num_samples);
        let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(segment as u64));
        for _ in 0..params.num_chunks_per_segment {
            if ctx.executor().cancel_token().is_cancelled() {
                anyhow::bail!(crate::error::EngineError::Cancelled {
                    context: ctx.executor().context().clone(),
                });
            }
            let start = rng.gen_range(0..=num_samples - chunk_size);
            let traces = recording.get_chunk(segment, None, start, start + chunk_size)?;
            for i in 0..traces.num_samples() {
                for (c, &value) in traces.row(i).iter().enumerate() {
                    per_channel[c].push(f64::from(value));
                }
            }
        }
    }

    let levels: Vec<f64> = per_channel
        .into_iter()
        .map(|mut values| {
            let center = median(&mut values);
            let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
            median(&mut deviations) / MAD_SCALE
        })
        .collect();

    Ok(ExtensionData::new()
        .with_array("noise_levels", NdArray::vector(levels))
        .with_attr("method", json!("mad")))
}
