//! Store descriptor and the metadata finalizer

use crate::compression::CodecSpec;
use crate::coordinator::IngestOutcome;
use crate::error::{IngestError, Result};
use crate::grid::{LivenessMask, ResolvedGrid};
use crate::layout::ChunkPlan;
use crate::stats::StatsSummary;
use crate::store::ArrayStore;
use crate::types::{Axis, DataType, SampleAxis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Descriptor format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Key range of one grid axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRange {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub count: usize,
}

/// Storage parameters of one named array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    pub data_type: DataType,
    /// Codec identifier, e.g. "zstd"
    pub codec_id: String,
    pub codec: CodecSpec,
    pub fill_value: f64,
}

/// Global liveness summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessSummary {
    pub live_cells: usize,
    pub total_cells: usize,
    pub fraction_live: f64,
    /// Cells dropped because their samples could not be read (best-effort mode)
    pub degraded_cells: usize,
}

/// Self-describing metadata of a complete store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDescriptor {
    /// Format version
    pub version: FormatVersion,

    /// Crate version that wrote the store
    pub api_version: String,

    /// Unique id of the ingestion run
    pub ingestion_id: Uuid,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Grid axes with their ordered key values
    pub axes: Vec<Axis>,

    /// Per-axis key ranges
    pub axis_ranges: Vec<AxisRange>,

    /// Trailing sample axis
    pub sample_axis: SampleAxis,

    pub grid_shape: Vec<usize>,
    pub chunk_shape: Vec<usize>,
    pub sample_chunk: usize,

    /// Arrays in the store by name
    pub arrays: BTreeMap<String, ArrayDescriptor>,

    pub liveness: LivenessSummary,

    /// Statistics over live samples
    pub statistics: StatsSummary,

    /// Number of source records ingested
    pub trace_count: usize,

    /// Custom metadata key-value pairs
    pub custom_metadata: BTreeMap<String, String>,
}

impl StoreDescriptor {
    /// Get custom metadata
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(|s| s.as_str())
    }

    /// Shape of the stored array, grid axes followed by the sample axis
    pub fn array_shape(&self) -> Vec<usize> {
        let mut shape = self.grid_shape.clone();
        shape.push(self.sample_axis.count);
        shape
    }

    /// Get a summary string of the store
    pub fn summary(&self) -> String {
        let shape = self
            .array_shape()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" x ");
        format!(
            "{}D store: {} ({} traces, {:.1}% live)",
            self.grid_shape.len() + 1,
            shape,
            self.trace_count,
            self.liveness.fraction_live * 100.0
        )
    }
}

/// Assembles and writes the store descriptor once every chunk is stored
pub struct MetadataFinalizer {
    store: ArrayStore,
    array_name: String,
    array: ArrayDescriptor,
    sample_axis: SampleAxis,
    custom_metadata: BTreeMap<String, String>,
}

impl MetadataFinalizer {
    pub fn new(store: ArrayStore, array_name: impl Into<String>, array: ArrayDescriptor) -> Self {
        Self {
            store,
            array_name: array_name.into(),
            array,
            sample_axis: SampleAxis::default(),
            custom_metadata: BTreeMap::new(),
        }
    }

    pub fn with_sample_axis(mut self, sample_axis: SampleAxis) -> Self {
        self.sample_axis = sample_axis;
        self
    }

    /// Add custom metadata
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_metadata.insert(key.into(), value.into());
    }

    /// Write the global live mask and then the descriptor.
    ///
    /// Refuses to write anything for an aborted ingestion.
    pub async fn finalize(
        &self,
        outcome: &IngestOutcome,
        grid: &ResolvedGrid,
        plan: &ChunkPlan,
    ) -> Result<StoreDescriptor> {
        let report = match outcome {
            IngestOutcome::Completed(report) => report,
            IngestOutcome::Aborted(err) => {
                return Err(IngestError::Metadata(format!(
                    "ingestion aborted, descriptor not written: {}",
                    err
                )))
            }
        };

        if report.cells_covered != grid.map.total_cells() {
            return Err(IngestError::Metadata(format!(
                "chunks cover {} of {} grid cells",
                report.cells_covered,
                grid.map.total_cells()
            )));
        }
        if report.live_cells + report.degraded.len() != grid.live_count() {
            return Err(IngestError::Metadata(format!(
                "chunks hold {} live and {} degraded cells, grid has {}",
                report.live_cells,
                report.degraded.len(),
                grid.live_count()
            )));
        }

        let mut bits = grid.liveness.bits().to_vec();
        for coord in &report.degraded {
            bits[grid.map.linear_index(coord)] = false;
        }
        let mask = LivenessMask::new(grid.shape().to_vec(), bits)?;
        if !report.degraded.is_empty() {
            warn!(
                degraded = report.degraded.len(),
                "cells marked absent after unreadable samples"
            );
        }

        let mut sample_axis = self.sample_axis.clone();
        sample_axis.count = grid.sample_count;

        let descriptor = StoreDescriptor {
            version: FormatVersion::CURRENT,
            api_version: crate::VERSION.to_string(),
            ingestion_id: Uuid::new_v4(),
            created_at: Utc::now(),
            axis_ranges: grid
                .axes
                .iter()
                .filter_map(|a| {
                    a.key_range().map(|(min, max)| AxisRange {
                        name: a.name.clone(),
                        min,
                        max,
                        count: a.len(),
                    })
                })
                .collect(),
            axes: grid.axes.clone(),
            sample_axis,
            grid_shape: grid.shape().to_vec(),
            chunk_shape: plan.chunk_shape().to_vec(),
            sample_chunk: plan.sample_chunk(),
            arrays: BTreeMap::from([(self.array_name.clone(), self.array.clone())]),
            liveness: LivenessSummary {
                live_cells: mask.count_live(),
                total_cells: grid.map.total_cells(),
                fraction_live: mask.fraction_live(),
                degraded_cells: report.degraded.len(),
            },
            statistics: report.stats.summary(),
            trace_count: mask.count_live(),
            custom_metadata: self.custom_metadata.clone(),
        };

        self.store.write_live_mask(&mask).await?;
        self.store.write_descriptor(&descriptor).await?;
        info!(summary = %descriptor.summary(), "store descriptor written");
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = FormatVersion::new(1, 0);
        let v1_1 = FormatVersion::new(1, 1);
        let v2_0 = FormatVersion::new(2, 0);

        assert!(v1_0.is_compatible(&v1_1));
        assert!(!v1_0.is_compatible(&v2_0));
    }
}
