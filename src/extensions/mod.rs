//! Built-in extensions, submitted to the registry through `inventory`.

pub mod noise_levels;
pub mod sparsity;
pub mod templates;
pub mod waveforms;

/// Median of `values`, reordering them. NaN sorts last; empty input gives 0.
pub(crate) fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Convert a duration in milliseconds to a sample count at `sampling_rate`,
/// dropping any partial sample.
pub(crate) fn ms_to_samples(ms: f64, sampling_rate: f64) -> usize {
    (ms * sampling_rate / 1000.0).floor().max(0.0) as usize
}
