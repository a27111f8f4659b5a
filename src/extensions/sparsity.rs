use serde::Deserialize;
use serde_json::json;
use spiketab_macros::ExtensionParams;

use super::templates;
use crate::error::EngineError;
use crate::extension::{ComputeContext, ExtensionData, NdArray};
use crate::registry::{BuiltinExtension, ExtensionDescriptor};

pub const NAME: &str = "sparsity";

#[derive(Debug, Clone, Deserialize, ExtensionParams)]
pub struct SparsityParams {
    /// `ptp` keeps channels whose peak-to-peak exceeds `threshold`;
    /// `best_channels` keeps the `num_channels` largest.
    #[param(default = "\"ptp\"")]
    pub method: String,
    #[param(default = "1.0", min = 0.0)]
    pub threshold: f64,
    #[param(default = "5", min = 1.0)]
    pub num_channels: usize,
}

pub fn descriptor() -> ExtensionDescriptor {
    ExtensionDescriptor::new(NAME)
        .depends_on(templates::NAME)
        .with_params::<SparsityParams>()
        .with_compute(compute)
}

inventory::submit! {
    BuiltinExtension { order: 40, factory: descriptor }
}

/// Channel mask per unit, `[units, channels]` of 0/1.
fn compute(ctx: &ComputeContext<'_>) -> anyhow::Result<ExtensionData> {
    let params: SparsityParams = ctx.decode_params()?;
    let best_channels = match params.method.as_str() {
        "ptp" => false,
        "best_channels" => true,
        other => anyhow::bail!(EngineError::InvalidParameter {
            extension: NAME.to_string(),
            parameter: "method".to_string(),
            reason: format!("expected `ptp` or `best_channels`, got `{other}`"),
        }),
    };

    let templates = ctx.dependency(templates::NAME)?.require_array("templates")?;
    let (num_units, nsamples, num_channels) = match *templates.shape() {
        [u, s, c] => (u, s, c),
        ref shape => anyhow::bail!(EngineError::InvalidPayload(format!(
            "templates must be 3-d, got shape {shape:?}"
        ))),
    };

    let mut mask = NdArray::zeros(vec![num_units, num_channels]);
    for u in 0..num_units {
        let ptp: Vec<f64> = (0..num_channels)
            .map(|c| {
                let column = (0..nsamples).filter_map(|t| templates.get(&[u, t, c]));
                let (lo, hi) = column.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
                if hi >= lo {
                    hi - lo
                } else {
                    0.0
                }
            })
            .collect();

        let row = &mut mask.data_mut()[u * num_channels..(u + 1) * num_channels];
        if best_channels {
            let mut order: Vec<usize> = (0..num_channels).collect();
            order.sort_by(|&a, &b| ptp[b].total_cmp(&ptp[a]).then(a.cmp(&b)));
            for &c in order.iter().take(params.num_channels) {
                row[c] = 1.0;
            }
        } else {
            for (c, &value) in ptp.iter().enumerate() {
                if value >= params.threshold {
                    row[c] = 1.0;
                }
            }
        }
    }

    Ok(ExtensionData::new()
        .with_array("mask", mask)
        .with_attr("method", json!(params.method)))
}
