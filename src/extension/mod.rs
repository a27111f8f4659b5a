//! Extension computations and the data they exchange.

mod context;
mod data;

pub use context::ComputeContext;
pub use data::{ExtensionData, NdArray};

/// A derived result computed from a recording, its event trains and the
/// payloads of the extensions it depends on.
///
/// Computations return `anyhow::Result` so they can use `?` on anything;
/// engine errors raised inside keep their kind when they reach the caller.
pub trait Extension: Send + Sync {
    fn compute(&self, ctx: &ComputeContext<'_>) -> anyhow::Result<ExtensionData>;
}

impl<F> Extension for F
where
    F: Fn(&ComputeContext<'_>) -> anyhow::Result<ExtensionData> + Send + Sync,
{
    fn compute(&self, ctx: &ComputeContext<'_>) -> anyhow::Result<ExtensionData> {
        self(ctx)
    }
}
