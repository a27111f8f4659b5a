use crate::error::{EngineError, Result};

/// A block of samples read from one segment: `num_samples` rows of
/// `num_channels` interleaved f32 values.
#[derive(Debug, Clone, PartialEq)]
pub struct Traces {
    num_samples: usize,
    num_channels: usize,
    data: Vec<f32>,
}

impl Traces {
    pub fn new(num_samples: usize, num_channels: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != num_samples * num_channels {
            return Err(EngineError::InvalidPayload(format!(
                "traces of {num_samples}x{num_channels} need {} values, got {}",
                num_samples * num_channels,
                data.len()
            )));
        }
        Ok(Self {
            num_samples,
            num_channels,
            data,
        })
    }

    pub fn zeros(num_samples: usize, num_channels: usize) -> Self {
        Self {
            num_samples,
            num_channels,
            data: vec![0.0; num_samples * num_channels],
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }

    /// Value at sample `i`, channel `c`. Panics when out of bounds, like slice indexing.
    pub fn sample(&self, i: usize, c: usize) -> f32 {
        assert!(c < self.num_channels, "channel {c} out of bounds");
        self.data[i * self.num_channels + c]
    }

    /// All channels of sample `i`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.num_channels..(i + 1) * self.num_channels]
    }

    /// Rows `start..end` as one contiguous slice.
    pub fn rows(&self, start: usize, end: usize) -> &[f32] {
        &self.data[start * self.num_channels..end * self.num_channels]
    }

    pub fn channel(&self, c: usize) -> impl Iterator<Item = f32> + '_ {
        self.data
            .iter()
            .skip(c)
            .step_by(self.num_channels.max(1))
            .copied()
    }

    /// Sum over every value, accumulated in f64.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }
}
