use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use spiketab_macros::ExtensionParams;

use super::median;
use super::waveforms::{self, waveforms_key};
use crate::error::EngineError;
use crate::extension::{ComputeContext, ExtensionData, NdArray};
use crate::registry::{BuiltinExtension, ExtensionDescriptor};

pub const NAME: &str = "templates";

#[derive(Debug, Clone, Deserialize, ExtensionParams)]
pub struct TemplatesParams {
    /// `average` or `median`.
    #[param(default = "\"average\"")]
    pub mode: String,
}

pub fn descriptor() -> ExtensionDescriptor {
    ExtensionDescriptor::new(NAME)
        .depends_on(waveforms::NAME)
        .with_params::<TemplatesParams>()
        .with_compute(compute)
}

inventory::submit! {
    BuiltinExtension { order: 30, factory: descriptor }
}

/// One template per unit, `[units, samples, channels]`. Units without any
/// extracted spike get an all-zero template.
fn compute(ctx: &ComputeContext<'_>) -> anyhow::Result<ExtensionData> {
    let params: TemplatesParams = ctx.decode_params()?;
    let use_median = match params.mode.as_str() {
        "average" => false,
        "median" => true,
        other => anyhow::bail!(EngineError::InvalidParameter {
            extension: NAME.to_string(),
            parameter: "mode".to_string(),
            reason: format!("expected `average` or `median`, got `{other}`"),
        }),
    };

    let waveforms = ctx.dependency(waveforms::NAME)?;
    let unit_ids: Vec<String> = waveforms
        .attr("unit_ids")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let num_channels = ctx.recording().num_channels();
    let nsamples = attr_usize(waveforms, "nbefore")? + attr_usize(waveforms, "nafter")?;
    let plane = nsamples * num_channels;

    let mut templates = NdArray::zeros(vec![unit_ids.len(), nsamples, num_channels]);
    let mut counts = Vec::with_capacity(unit_ids.len());
    for (u, unit_id) in unit_ids.iter().enumerate() {
        let snippets = waveforms.require_array(&waveforms_key(unit_id))?;
        let n = snippets.shape().first().copied().unwrap_or(0);
        counts.push(n as f64);
        if n == 0 {
            continue;
        }
        let out = &mut templates.data_mut()[u * plane..(u + 1) * plane];
        let data = snippets.data();
        for (j, value) in out.iter_mut().enumerate() {
            *value = if use_median {
                let mut column: Vec<f64> = (0..n).map(|i| data[i * plane + j]).collect();
                median(&mut column)
            } else {
                (0..n).map(|i| data[i * plane + j]).sum::<f64>() / n as f64
            };
        }
    }

    Ok(ExtensionData::new()
        .with_array("templates", templates)
        .with_array("spike_counts", NdArray::vector(counts))
        .with_attr("unit_ids", json!(unit_ids))
        .with_attr("mode", json!(params.mode))
        .with_attr("nbefore", waveforms.attr("nbefore").cloned().unwrap_or(json!(0))))
}

pub(crate) fn attr_usize(data: &ExtensionData, key: &str) -> anyhow::Result<usize> {
    data.attr(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .with_context(|| format!("attribute `{key}` missing or not an integer"))
}
