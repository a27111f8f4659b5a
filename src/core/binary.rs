use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::fingerprint::Fingerprint;
use super::recording::{check_chunk_request, metadata_fingerprint};
use super::{Recording, Traces};
use crate::error::{EngineError, Result};

const F32_BYTES: usize = std::mem::size_of::<f32>();

struct MappedSegment {
    path: PathBuf,
    map: Mmap,
    num_samples: usize,
}

/// Recording backed by raw little-endian f32 files, one per segment,
/// samples interleaved by channel. Files are memory-mapped read-only.
pub struct BinaryRecording {
    sampling_rate: f64,
    num_channels: usize,
    header_offset: usize,
    segments: Vec<MappedSegment>,
}

impl BinaryRecording {
    pub fn open<P: AsRef<Path>>(
        paths: &[P],
        sampling_rate: f64,
        num_channels: usize,
        header_offset: usize,
    ) -> Result<Self> {
        if sampling_rate <= 0.0 || !sampling_rate.is_finite() {
            return Err(EngineError::InvalidConfig(format!(
                "sampling rate must be positive, got {sampling_rate}"
            )));
        }
        if num_channels == 0 || paths.is_empty() {
            return Err(EngineError::InvalidConfig(
                "a binary recording needs at least one channel and one segment file".to_string(),
            ));
        }

        let frame = num_channels * F32_BYTES;
        let mut segments = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref().to_path_buf();
            let file = File::open(&path)?;
            // SAFETY: the map is read-only and the engine never writes to
            // recording files; external truncation is outside its contract.
            let map = unsafe { Mmap::map(&file)? };
            let body = map.len().checked_sub(header_offset).ok_or_else(|| {
                EngineError::InvalidConfig(format!(
                    "{} is shorter than its {header_offset} byte header",
                    path.display()
                ))
            })?;
            if body % frame != 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "{} holds {body} data bytes, not a multiple of {frame} ({num_channels} channels of f32)",
                    path.display()
                )));
            }
            segments.push(MappedSegment {
                path,
                map,
                num_samples: body / frame,
            });
        }

        tracing::debug!(
            segments = segments.len(),
            num_channels,
            sampling_rate,
            "opened binary recording"
        );

        Ok(Self {
            sampling_rate,
            num_channels,
            header_offset,
            segments,
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.segments.iter().map(|s| s.path.as_path())
    }

    /// Write interleaved samples as a headerless segment file.
    pub fn write_segment(path: impl AsRef<Path>, interleaved: &[f32]) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut bytes = Vec::with_capacity(interleaved.len() * F32_BYTES);
        for value in interleaved {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }
}

impl Recording for BinaryRecording {
    fn num_segments(&self) -> usize {
        self.segments.len()
    }

    fn num_samples(&self, segment_index: usize) -> Result<usize> {
        self.segments
            .get(segment_index)
            .map(|s| s.num_samples)
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
        let segment = &self.segments[segment_index];
        let frame = self.num_channels * F32_BYTES;
        let from = self.header_offset + start * frame;
        let to = self.header_offset + end * frame;
        let bytes = &segment.map[from..to];

        let decode = |offset: usize| {
            let mut raw = [0u8; F32_BYTES];
            raw.copy_from_slice(&bytes[offset..offset + F32_BYTES]);
            f32::from_le_bytes(raw)
        };

        let num_samples = end - start;
        let data = match channels {
            None => (0..num_samples * self.num_channels)
                .map(|i| decode(i * F32_BYTES))
                .collect(),
            Some(channels) => {
                let mut data = Vec::with_capacity(num_samples * channels.len());
                for i in 0..num_samples {
                    data.extend(channels.iter().map(|&c| decode(i * frame + c * F32_BYTES)));
                }
                data
            }
        };

        Traces::new(
            num_samples,
            channels.map(|c| c.len()).unwrap_or(self.num_channels),
            data,
        )
    }

    fn fingerprint(&self) -> String {
        let mut fp = Fingerprint::new();
        fp.str(&metadata_fingerprint(self))
            .u64(self.header_offset as u64);
        // samples only: a file rewritten in place must not keep its identity
        for segment in &self.segments {
            fp.bytes(&segment.map[self.header_offset..]);
        }
        fp.finish()
    }
}
