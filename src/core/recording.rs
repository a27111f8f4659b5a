use std::sync::Arc;

use super::fingerprint::Fingerprint;
use super::Traces;
use crate::error::{EngineError, Result};

/// Read-only view over a segmented multichannel time series.
///
/// Implementations must be safe to read from many workers at once: no
/// cursor, no interior mutation on the read path.
pub trait Recording: Send + Sync {
    fn num_segments(&self) -> usize;

    /// Fails with `UnknownSegment` for an invalid index.
    fn num_samples(&self, segment_index: usize) -> Result<usize>;

    fn num_channels(&self) -> usize;

    fn sampling_rate(&self) -> f64;

    /// Samples `start..end` of one segment, restricted to `channels` when given
    /// (in the requested order).
    fn get_chunk(
        &self,
        segment_index: usize,
        channels: Option<&[usize]>,
        start: usize,
        end: usize,
    ) -> Result<Traces>;

    /// Bytes per stored sample value.
    fn sample_size(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    /// Stable content fingerprint, used to bind an analysis identity.
    fn fingerprint(&self) -> String {
        metadata_fingerprint(self)
    }

    fn total_samples(&self) -> usize {
        (0..self.num_segments())
            .filter_map(|s| self.num_samples(s).ok())
            .sum()
    }
}

/// Fingerprint over shape and rate only.
pub fn metadata_fingerprint<R: Recording + ?Sized>(recording: &R) -> String {
    let mut fp = Fingerprint::new();
    fp.u64(recording.num_segments() as u64)
        .u64(recording.num_channels() as u64)
        .f64(recording.sampling_rate());
    for segment in 0..recording.num_segments() {
        fp.u64(recording.num_samples(segment).unwrap_or(0) as u64);
    }
    fp.finish()
}

/// Validate a chunk request and return the segment length.
pub fn check_chunk_request<R: Recording + ?Sized>(
    recording: &R,
    segment_index: usize,
    channels: Option<&[usize]>,
    start: usize,
    end: usize,
) -> Result<usize> {
    let len = recording.num_samples(segment_index)?;
    if start > end || end > len {
        return Err(EngineError::OutOfRange {
            segment: segment_index,
            start,
            end,
            len,
        });
    }
    let num_channels = recording.num_channels();
    if let Some(channels) = channels {
        if let Some(&channel) = channels.iter().find(|&&c| c >= num_channels) {
            return Err(EngineError::UnknownChannel {
                channel,
                num_channels,
            });
        }
    }
    Ok(len)
}

/// Copy rows `start..end` of an interleaved buffer, keeping only `channels`.
pub(crate) fn gather_rows(
    interleaved: &[f32],
    num_channels: usize,
    channels: Option<&[usize]>,
    start: usize,
    end: usize,
) -> Result<Traces> {
    let rows = &interleaved[start * num_channels..end * num_channels];
    match channels {
        None => Traces::new(end - start, num_channels, rows.to_vec()),
        Some(channels) => {
            let mut data = Vec::with_capacity((end - start) * channels.len());
            for row in rows.chunks_exact(num_channels) {
                data.extend(channels.iter().map(|&c| row[c]));
            }
            Traces::new(end - start, channels.len(), data)
        }
    }
}

/// Recording held in memory. Segment buffers are shared, never copied, when
/// the recording is cloned.
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    sampling_rate: f64,
    num_channels: usize,
    segments: Vec<Arc<[f32]>>,
}

impl InMemoryRecording {
    /// `segments` hold interleaved samples (`sample * num_channels + channel`).
    pub fn new(sampling_rate: f64, num_channels: usize, segments: Vec<Vec<f32>>) -> Result<Self> {
        if sampling_rate <= 0.0 || !sampling_rate.is_finite() {
            return Err(EngineError::InvalidConfig(format!(
                "sampling rate must be positive, got {sampling_rate}"
            )));
        }
        if num_channels == 0 {
            return Err(EngineError::InvalidConfig(
                "a recording needs at least one channel".to_string(),
            ));
        }
        if segments.is_empty() {
            return Err(EngineError::InvalidConfig(
                "a recording needs at least one segment".to_string(),
            ));
        }
        for (index, segment) in segments.iter().enumerate() {
            if segment.len() % num_channels != 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "segment {index} has {} values, not a multiple of {num_channels} channels",
                    segment.len()
                )));
            }
        }

        Ok(Self {
            sampling_rate,
            num_channels,
            segments: segments.into_iter().map(Arc::from).collect(),
        })
    }

    /// Build from per-channel vectors (`channels[c][sample]`), one entry per segment.
    pub fn from_channels(sampling_rate: f64, segments: Vec<Vec<Vec<f32>>>) -> Result<Self> {
        let num_channels = segments.first().map(|s| s.len()).unwrap_or(0);
        let mut interleaved = Vec::with_capacity(segments.len());
        for (index, channels) in segments.into_iter().enumerate() {
            if channels.len() != num_channels {
                return Err(EngineError::InvalidConfig(format!(
                    "segment {index} has {} channels, expected {num_channels}",
                    channels.len()
                )));
            }
            let len = channels.first().map(|c| c.len()).unwrap_or(0);
            if channels.iter().any(|c| c.len() != len) {
                return Err(EngineError::InvalidConfig(format!(
                    "segment {index} has channels of different lengths"
                )));
            }
            let mut data = Vec::with_capacity(len * num_channels);
            for i in 0..len {
                data.extend(channels.iter().map(|c| c[i]));
            }
            interleaved.push(data);
        }
        Self::new(sampling_rate, num_channels, interleaved)
    }
}

impl Recording for InMemoryRecording {
    fn num_segments(&self) -> usize {
        self.segments.len()
    }

    fn num_samples(&self, segment_index: usize) -> Result<usize> {
        self.segments
            .get(segment_index)
            .map(|s| s.len() / self.num_channels)
            .ok_or(EngineError::UnknownSegment {
                segment: segment_index,
                num_segments: self.segments.len(),
            })
    }

    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    fn get_chunk(
        &self,
        segment_index: usize,
        channels: Option<&[usize]>,
        start: usize,
        end: usize,
    ) -> Result<Traces> {
        check_chunk_request(self, segment_index, channels, start, end)?;
        gather_rows(
            &self.segments[segment_index],
            self.num_channels,
            channels,
            start,
            end,
        )
    }

    fn fingerprint(&self) -> String {
        let mut fp = Fingerprint::new();
        fp.str(&metadata_fingerprint(self));
        for segment in &self.segments {
            let mut bytes = Vec::with_capacity(segment.len() * 4);
            for value in segment.iter() {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            fp.bytes(&bytes);
        }
        fp.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> InMemoryRecording {
        // 2 channels, 5 samples: ch0 = i, ch1 = 100 + i
        let data: Vec<f32> = (0..5).flat_map(|i| [i as f32, 100.0 + i as f32]).collect();
        InMemoryRecording::new(1000.0, 2, vec![data]).unwrap()
    }

    #[test]
    fn test_get_chunk_full_and_subset() {
        let rec = ramp();
        let all = rec.get_chunk(0, None, 1, 3).unwrap();
        assert_eq!(all.data(), &[1.0, 101.0, 2.0, 102.0]);

        let swapped = rec.get_chunk(0, Some(&[1, 0]), 4, 5).unwrap();
        assert_eq!(swapped.data(), &[104.0, 4.0]);
    }

    #[test]
    fn test_out_of_range_and_unknown_channel() {
        let rec = ramp();
        assert!(matches!(
            rec.get_chunk(0, None, 3, 6),
            Err(EngineError::OutOfRange { len: 5, .. })
        ));
        assert!(matches!(
            rec.get_chunk(0, None, 4, 2),
            Err(EngineError::OutOfRange { .. })
        ));
        assert!(matches!(
            rec.get_chunk(0, Some(&[2]), 0, 1),
            Err(EngineError::UnknownChannel { channel: 2, .. })
        ));
        assert!(matches!(
            rec.get_chunk(3, None, 0, 1),
            Err(EngineError::UnknownSegment { segment: 3, .. })
        ));
    }

    #[test]
    fn test_empty_range_is_allowed() {
        let rec = ramp();
        let empty = rec.get_chunk(0, None, 5, 5).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_from_channels_interleaves() {
        let rec = InMemoryRecording::from_channels(
            10.0,
            vec![vec![vec![1.0, 2.0], vec![3.0, 4.0]]],
        )
        .unwrap();
        assert_eq!(rec.num_channels(), 2);
        assert_eq!(rec.get_chunk(0, None, 0, 2).unwrap().data(), &[1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = ramp();
        let mut data: Vec<f32> = (0..5).flat_map(|i| [i as f32, 100.0 + i as f32]).collect();
        data[3] = -1.0;
        let b = InMemoryRecording::new(1000.0, 2, vec![data]).unwrap();
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_rejects_ragged_segments() {
        assert!(InMemoryRecording::new(1000.0, 2, vec![vec![0.0; 3]]).is_err());
        assert!(InMemoryRecording::new(0.0, 2, vec![vec![0.0; 4]]).is_err());
    }
}
