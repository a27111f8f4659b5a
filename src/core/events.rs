use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use super::Recording;
use crate::error::{EngineError, Result};

/// One entry of the flattened spike vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Spike {
    pub segment_index: usize,
    pub sample_index: usize,
    pub unit_index: usize,
}

#[derive(Debug, Clone)]
struct UnitTrain {
    id: String,
    // per segment, ascending sample indices
    segments: Vec<Vec<usize>>,
}

/// Event times per labelled unit. Units keep their insertion order.
#[derive(Debug, Clone)]
pub struct EventTrains {
    num_segments: usize,
    units: Vec<UnitTrain>,
    index: HashMap<String, usize>,
}

impl EventTrains {
    pub fn new(num_segments: usize) -> Self {
        Self {
            num_segments,
            units: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Build from `(unit_id, [(segment_index, sample_index), ...])` pairs.
    pub fn from_units<I, S, E>(num_segments: usize, units: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, E)>,
        S: Into<String>,
        E: IntoIterator<Item = (usize, usize)>,
    {
        let mut trains = Self::new(num_segments);
        for (id, events) in units {
            trains.add_unit(id, events)?;
        }
        Ok(trains)
    }

    /// Add a unit. Events must be ordered by segment, then sample.
    pub fn add_unit(
        &mut self,
        id: impl Into<String>,
        events: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<()> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(EngineError::InvalidEvents(format!("duplicate unit `{id}`")));
        }

        let mut segments = vec![Vec::new(); self.num_segments];
        let mut last: Option<(usize, usize)> = None;
        for (segment, sample) in events {
            if segment >= self.num_segments {
                return Err(EngineError::InvalidEvents(format!(
                    "unit `{id}` has an event in segment {segment}, only {} segments exist",
                    self.num_segments
                )));
            }
            if let Some(prev) = last {
                if (segment, sample) < prev {
                    return Err(EngineError::InvalidEvents(format!(
                        "unit `{id}` events are not ordered: ({}, {}) after ({}, {})",
                        segment, sample, prev.0, prev.1
                    )));
                }
            }
            last = Some((segment, sample));
            segments[segment].push(sample);
        }

        self.index.insert(id.clone(), self.units.len());
        self.units.push(UnitTrain { id, segments });
        Ok(())
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    pub fn unit_ids(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.id.as_str())
    }

    pub fn unit_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Sample indices of one unit within one segment.
    pub fn segment_events(&self, unit_index: usize, segment_index: usize) -> &[usize] {
        self.units
            .get(unit_index)
            .and_then(|u| u.segments.get(segment_index))
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    /// All `(segment_index, sample_index)` pairs of a unit.
    pub fn events(&self, id: &str) -> Option<Vec<(usize, usize)>> {
        let unit = &self.units[self.unit_index(id)?];
        Some(
            unit.segments
                .iter()
                .enumerate()
                .flat_map(|(seg, samples)| samples.iter().map(move |&s| (seg, s)))
                .collect(),
        )
    }

    pub fn num_events(&self, unit_index: usize) -> usize {
        self.units
            .get(unit_index)
            .map(|u| u.segments.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn total_events(&self) -> usize {
        (0..self.units.len()).map(|u| self.num_events(u)).sum()
    }

    /// Every event of every unit, ordered by segment, sample, then unit.
    pub fn spike_vector(&self) -> Vec<Spike> {
        let mut spikes: Vec<Spike> = self
            .units
            .iter()
            .enumerate()
            .flat_map(|(unit_index, unit)| {
                unit.segments
                    .iter()
                    .enumerate()
                    .flat_map(move |(segment_index, samples)| {
                        samples.iter().map(move |&sample_index| Spike {
                            segment_index,
                            sample_index,
                            unit_index,
                        })
                    })
            })
            .collect();
        spikes.sort_unstable();
        spikes
    }

    /// Events must fall inside the recording they annotate.
    pub fn check_against(&self, recording: &dyn Recording) -> Result<()> {
        if recording.num_segments() != self.num_segments {
            return Err(EngineError::InvalidEvents(format!(
                "event trains span {} segments, recording has {}",
                self.num_segments,
                recording.num_segments()
            )));
        }
        for segment in 0..self.num_segments {
            let len = recording.num_samples(segment)?;
            for unit in &self.units {
                if let Some(&last) = unit.segments[segment].last() {
                    if last >= len {
                        return Err(EngineError::InvalidEvents(format!(
                            "unit `{}` has sample {last} beyond segment {segment} ({len} samples)",
                            unit.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        let mut fp = Fingerprint::new();
        fp.u64(self.num_segments as u64);
        for unit in &self.units {
            fp.str(&unit.id);
            for samples in &unit.segments {
                fp.u64(samples.len() as u64);
                for &s in samples {
                    fp.u64(s as u64);
                }
            }
        }
        fp.finish()
    }
}
