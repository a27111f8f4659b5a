use serde::{Deserialize, Serialize};

use crate::core::{check_chunk_request, Recording};
use crate::error::{EngineError, Result};

/// How a segment is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// Fixed number of samples per chunk.
    FixedSamples { samples: usize },
    /// Memory target per chunk, divided by channel count and sample size.
    MemoryBudget { bytes: usize },
    /// Chunk length in seconds at the recording's sampling rate.
    Duration { seconds: f64 },
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        ChunkPolicy::Duration { seconds: 1.0 }
    }
}

impl ChunkPolicy {
    /// Samples per chunk, never less than one.
    pub fn chunk_len(&self, num_channels: usize, sample_size: usize, sampling_rate: f64) -> usize {
        let len = match *self {
            ChunkPolicy::FixedSamples { samples } => samples,
            ChunkPolicy::MemoryBudget { bytes } => {
                bytes / (num_channels.max(1) * sample_size.max(1))
            }
            ChunkPolicy::Duration { seconds } => {
                let samples = seconds * sampling_rate;
                if samples.is_finite() && samples > 0.0 {
                    samples as usize
                } else {
                    0
                }
            }
        };
        len.max(1)
    }
}

/// A contiguous range `start..end` of one segment. `index` is the position of
/// the chunk within its execution run and fixes the merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub segment_index: usize,
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Cut `0..num_samples` into ascending, gap-free ranges of at most
/// `chunk_len` samples. An empty segment still yields one empty range.
pub fn partition(num_samples: usize, chunk_len: usize) -> Vec<(usize, usize)> {
    let chunk_len = chunk_len.max(1);
    if num_samples == 0 {
        return vec![(0, 0)];
    }
    (0..num_samples)
        .step_by(chunk_len)
        .map(|start| (start, (start + chunk_len).min(num_samples)))
        .collect()
}

/// Chunks for the given segments, numbered across segments in ascending order.
pub fn plan_chunks(
    recording: &dyn Recording,
    policy: &ChunkPolicy,
    segments: &[usize],
    num_channels: usize,
) -> Result<Vec<Chunk>> {
    let chunk_len = policy.chunk_len(
        num_channels,
        recording.sample_size(),
        recording.sampling_rate(),
    );
    let mut chunks = Vec::new();
    for &segment_index in segments {
        let num_samples = check_chunk_request(recording, segment_index, None, 0, 0)?;
        for (start, end) in partition(num_samples, chunk_len) {
            chunks.push(Chunk {
                index: chunks.len(),
                segment_index,
                start,
                end,
            });
        }
    }
    Ok(chunks)
}

/// Parse a memory size such as `"10M"`, `"512k"`, `"1G"` or `"4096"` into bytes.
pub fn parse_memory(value: &str) -> Result<usize> {
    let trimmed = value.trim();
    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((i, 'k' | 'K')) => (&trimmed[..i], 1usize << 10),
        Some((i, 'm' | 'M')) => (&trimmed[..i], 1 << 20),
        Some((i, 'g' | 'G')) => (&trimmed[..i], 1 << 30),
        _ => (trimmed, 1),
    };
    let amount: f64 = digits
        .trim()
        .parse()
        .map_err(|_| EngineError::InvalidConfig(format!("cannot parse memory size `{value}`")))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "memory size must be positive, got `{value}`"
        )));
    }
    Ok((amount * multiplier as f64) as usize)
}

/// Parse a duration such as `"1s"`, `"250ms"` or `"0.5"` into seconds.
pub fn parse_duration(value: &str) -> Result<f64> {
    let trimmed = value.trim();
    let (digits, scale) = if let Some(ms) = trimmed.strip_suffix("ms") {
        (ms, 1e-3)
    } else if let Some(s) = trimmed.strip_suffix('s') {
        (s, 1.0)
    } else {
        (trimmed, 1.0)
    };
    let amount: f64 = digits
        .trim()
        .parse()
        .map_err(|_| EngineError::InvalidConfig(format!("cannot parse duration `{value}`")))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "duration must be positive, got `{value}`"
        )));
    }
    Ok(amount * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_exactly() {
        assert_eq!(partition(10, 4), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(partition(8, 4), vec![(0, 4), (4, 8)]);
        assert_eq!(partition(3, 10), vec![(0, 3)]);
        assert_eq!(partition(0, 10), vec![(0, 0)]);
        assert_eq!(partition(2, 0), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_chunk_len_per_policy() {
        assert_eq!(ChunkPolicy::FixedSamples { samples: 2500 }.chunk_len(4, 4, 30_000.0), 2500);
        assert_eq!(ChunkPolicy::FixedSamples { samples: 0 }.chunk_len(4, 4, 30_000.0), 1);
        assert_eq!(ChunkPolicy::MemoryBudget { bytes: 1600 }.chunk_len(4, 4, 30_000.0), 100);
        assert_eq!(ChunkPolicy::MemoryBudget { bytes: 3 }.chunk_len(4, 4, 30_000.0), 1);
        assert_eq!(ChunkPolicy::Duration { seconds: 0.5 }.chunk_len(4, 4, 30_000.0), 15_000);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_memory("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1 << 30);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("-1M").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s").unwrap(), 1.0);
        assert_eq!(parse_duration("250ms").unwrap(), 0.25);
        assert_eq!(parse_duration("0.5").unwrap(), 0.5);
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_policy_serde_shape() {
        let policy: ChunkPolicy =
            serde_json::from_value(serde_json::json!({"kind": "fixed_samples", "samples": 100}))
                .unwrap();
        assert_eq!(policy, ChunkPolicy::FixedSamples { samples: 100 });
    }
}
