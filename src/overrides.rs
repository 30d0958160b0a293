//! Grid overrides - header transforms applied before grid resolution
//!
//! Streamer acquisitions often number channels in ways that do not form a
//! regular grid (channels running on across cables, or several traces per
//! key tuple). These commands rewrite the header index so the resolver sees a
//! dense geometry. Overrides run in the order given.

use crate::error::{IngestError, Result};
use crate::header_index::HeaderIndex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

pub const SHOT_POINT: &str = "shot_point";
pub const CABLE: &str = "cable";
pub const CHANNEL: &str = "channel";
/// Axis appended by [`GridOverride::HasDuplicates`] and [`GridOverride::NonBinned`]
pub const TRACE: &str = "trace";

/// A header transform applied to the index before resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GridOverride {
    /// Detect the streamer channel numbering and renumber channels per cable
    AutoChannelWrap,
    /// Wrap channels so each cable starts from one
    ChannelWrap { channels_per_cable: i64 },
    /// Derive cable numbers from unwrapped channel numbers
    CalculateCable { channels_per_cable: i64 },
    /// Number traces sharing a key tuple along a new `trace` axis (chunk 1)
    HasDuplicates,
    /// Like `HasDuplicates`, with an explicit chunk length for the new axis
    NonBinned { chunk: usize },
}

/// Streamer shot geometry, as detected by [`GridOverride::AutoChannelWrap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerGeometry {
    /// Every cable numbers its channels from the same start
    A,
    /// Channel numbers continue across cables without overlap
    B,
}

impl GridOverride {
    pub fn name(&self) -> &'static str {
        match self {
            GridOverride::AutoChannelWrap => "AutoChannelWrap",
            GridOverride::ChannelWrap { .. } => "ChannelWrap",
            GridOverride::CalculateCable { .. } => "CalculateCable",
            GridOverride::HasDuplicates => "HasDuplicates",
            GridOverride::NonBinned { .. } => "NonBinned",
        }
    }

    fn required_keys(&self) -> &'static [&'static str] {
        match self {
            GridOverride::AutoChannelWrap
            | GridOverride::ChannelWrap { .. }
            | GridOverride::CalculateCable { .. } => &[SHOT_POINT, CABLE, CHANNEL],
            GridOverride::HasDuplicates | GridOverride::NonBinned { .. } => &[],
        }
    }

    fn incompatible_with(&self) -> &'static [&'static str] {
        match self {
            GridOverride::AutoChannelWrap => &["ChannelWrap", "CalculateCable"],
            GridOverride::ChannelWrap { .. } | GridOverride::CalculateCable { .. } => {
                &["AutoChannelWrap"]
            }
            GridOverride::HasDuplicates | GridOverride::NonBinned { .. } => {
                &["ChannelWrap", "CalculateCable", "HasDuplicates", "NonBinned"]
            }
        }
    }

    fn validate(&self, index: &HeaderIndex, all: &[GridOverride]) -> Result<()> {
        for other in all.iter().filter(|o| *o != self) {
            if self.incompatible_with().contains(&other.name()) {
                return Err(IngestError::GridOverride(format!(
                    "{} is incompatible with {}",
                    self.name(),
                    other.name()
                )));
            }
        }
        let missing: Vec<&str> = self
            .required_keys()
            .iter()
            .copied()
            .filter(|k| index.axis_position(k).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::GridOverride(format!(
                "{} requires header keys {:?}",
                self.name(),
                missing
            )));
        }
        match self {
            GridOverride::ChannelWrap { channels_per_cable }
            | GridOverride::CalculateCable { channels_per_cable }
                if *channels_per_cable <= 0 =>
            {
                Err(IngestError::GridOverride(format!(
                    "{} requires a positive channels_per_cable",
                    self.name()
                )))
            }
            GridOverride::NonBinned { chunk: 0 } => Err(IngestError::GridOverride(
                "NonBinned requires a positive chunk".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Transform the index and, for overrides that add an axis, the chunk shape
    pub fn apply(&self, index: &mut HeaderIndex, chunk_shape: Option<&mut Vec<usize>>) -> Result<()> {
        match self {
            GridOverride::AutoChannelWrap => {
                auto_channel_wrap(index)?;
            }
            GridOverride::ChannelWrap { channels_per_cable } => {
                let channel = axis(index, CHANNEL)?;
                let wrapped = index
                    .column(channel)
                    .iter()
                    .map(|c| (c - 1).rem_euclid(*channels_per_cable) + 1)
                    .collect();
                index.set_column(channel, wrapped)?;
            }
            GridOverride::CalculateCable { channels_per_cable } => {
                let channel = axis(index, CHANNEL)?;
                let cable = axis(index, CABLE)?;
                let cables = index
                    .column(channel)
                    .iter()
                    .map(|c| (c - 1).div_euclid(*channels_per_cable) + 1)
                    .collect();
                index.set_column(cable, cables)?;
            }
            GridOverride::HasDuplicates => {
                index.push_axis(TRACE, duplicate_ordinals(index))?;
                if let Some(shape) = chunk_shape {
                    shape.push(1);
                }
            }
            GridOverride::NonBinned { chunk } => {
                index.push_axis(TRACE, duplicate_ordinals(index))?;
                if let Some(shape) = chunk_shape {
                    shape.push(*chunk);
                }
            }
        }
        Ok(())
    }
}

/// Validate and run every override in order
pub fn apply_overrides(
    index: &mut HeaderIndex,
    overrides: &[GridOverride],
    mut chunk_shape: Option<&mut Vec<usize>>,
) -> Result<()> {
    for command in overrides {
        command.validate(index, overrides)?;
    }
    for command in overrides {
        info!(command = command.name(), "applying grid override");
        command.apply(index, chunk_shape.as_deref_mut())?;
    }
    Ok(())
}

fn axis(index: &HeaderIndex, name: &str) -> Result<usize> {
    index
        .axis_position(name)
        .ok_or_else(|| IngestError::GridOverride(format!("missing header key '{}'", name)))
}

/// 1-based occurrence number of each record's key tuple
fn duplicate_ordinals(index: &HeaderIndex) -> Vec<i64> {
    let mut counter: HashMap<Vec<i64>, i64> = HashMap::new();
    (0..index.len())
        .map(|row| {
            let count = counter.entry(index.keys(row)).or_insert(0);
            *count += 1;
            *count
        })
        .collect()
}

/// Per-cable channel range and the geometry it implies
pub fn analyze_streamer_headers(
    index: &HeaderIndex,
) -> Result<(BTreeMap<i64, (i64, i64)>, StreamerGeometry)> {
    let cable = axis(index, CABLE)?;
    let channel = axis(index, CHANNEL)?;

    let mut ranges: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
    for (&cab, &chan) in index.column(cable).iter().zip(index.column(channel)) {
        let range = ranges.entry(cab).or_insert((chan, chan));
        range.0 = range.0.min(chan);
        range.1 = range.1.max(chan);
    }

    let overlapping = ranges.iter().any(|(a, &(min_a, max_a))| {
        ranges
            .iter()
            .any(|(b, &(min_b, max_b))| a != b && min_b < max_a && max_b > min_a)
    });
    let geometry = if overlapping {
        StreamerGeometry::A
    } else {
        StreamerGeometry::B
    };
    Ok((ranges, geometry))
}

fn auto_channel_wrap(index: &mut HeaderIndex) -> Result<()> {
    let (ranges, geometry) = analyze_streamer_headers(index)?;
    info!(geometry = ?geometry, cables = ranges.len(), "detected streamer geometry");
    for (cable, (min, max)) in &ranges {
        info!(cable, min_channel = min, max_channel = max, "cable channel range");
    }

    if geometry == StreamerGeometry::B {
        let cable = axis(index, CABLE)?;
        let channel = axis(index, CHANNEL)?;
        let renumbered = index
            .column(cable)
            .iter()
            .zip(index.column(channel))
            .map(|(cab, chan)| chan - ranges[cab].0 + 1)
            .collect();
        index.set_column(channel, renumbered)?;
    }
    Ok(())
}
