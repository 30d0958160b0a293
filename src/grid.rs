//! Grid resolver - turns a header index into a dense grid
//!
//! Each axis's distinct key values are ranked according to an ordering policy;
//! a record's grid coordinate is the tuple of its per-axis ranks. The result is
//! a dense coordinate → offset map plus a liveness mask over the same shape.

use crate::error::{IngestError, Result};
use crate::header_index::HeaderIndex;
use crate::types::{Axis, DataType};
use crate::utils::{pack_bits, row_major_strides};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// How the distinct values of an axis are ranked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisOrdering {
    /// Numeric ascending
    #[default]
    Ascending,
    /// Numeric descending
    Descending,
    /// Exactly this order; every observed value must be listed
    Explicit(Vec<i64>),
}

/// What to do when two records map to the same grid cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Abort the ingestion with `DuplicateCoordinate`
    #[default]
    Fail,
    /// Keep the record seen first and drop later ones
    KeepFirst,
    /// Keep the record seen last
    KeepLast,
}

/// Two records that resolved to the same cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub keys: Vec<i64>,
    pub coord: Vec<usize>,
    pub first_offset: u64,
    pub second_offset: u64,
}

const ABSENT: u64 = u64::MAX;

/// Dense map from grid coordinate to source record offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinateMap {
    shape: Vec<usize>,
    strides: Vec<usize>,
    cells: Vec<u64>,
    live: usize,
}

impl CoordinateMap {
    fn new(shape: Vec<usize>) -> Result<Self> {
        let total = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                IngestError::InvalidDimensions(format!("grid {:?} is too large", shape))
            })?;
        Ok(Self {
            strides: row_major_strides(&shape),
            shape,
            cells: vec![ABSENT; total],
            live: 0,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of cells in the grid
    pub fn total_cells(&self) -> usize {
        self.cells.len()
    }

    /// Number of cells backed by a record
    pub fn live_cells(&self) -> usize {
        self.live
    }

    /// Row-major linear index of a coordinate
    pub fn linear_index(&self, coord: &[usize]) -> usize {
        coord.iter().zip(&self.strides).map(|(c, s)| c * s).sum()
    }

    /// Coordinate of a row-major linear index
    pub fn coord_of(&self, mut linear: usize) -> Vec<usize> {
        self.strides
            .iter()
            .map(|s| {
                let c = linear / s;
                linear %= s;
                c
            })
            .collect()
    }

    /// Offset at a coordinate, `None` for absent or out-of-bounds cells
    pub fn get(&self, coord: &[usize]) -> Option<u64> {
        if coord.len() != self.shape.len() || coord.iter().zip(&self.shape).any(|(c, d)| c >= d) {
            return None;
        }
        self.get_linear(self.linear_index(coord))
    }

    pub fn get_linear(&self, linear: usize) -> Option<u64> {
        match self.cells.get(linear) {
            Some(&ABSENT) | None => None,
            Some(&offset) => Some(offset),
        }
    }

    /// Previous occupant, if any
    fn insert(&mut self, linear: usize, offset: u64) -> Option<u64> {
        let previous = std::mem::replace(&mut self.cells[linear], offset);
        if previous == ABSENT {
            self.live += 1;
            None
        } else {
            Some(previous)
        }
    }

    /// Iterate `(linear index, offset)` over live cells
    pub fn iter_live(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, &o)| o != ABSENT)
            .map(|(i, &o)| (i, o))
    }
}

/// Boolean mask over the grid; `true` marks cells with a backing record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessMask {
    shape: Vec<usize>,
    bits: Vec<bool>,
}

impl LivenessMask {
    pub fn new(shape: Vec<usize>, bits: Vec<bool>) -> Result<Self> {
        let total: usize = shape.iter().product();
        if bits.len() != total {
            return Err(IngestError::InvalidDimensions(format!(
                "mask of {} cells for shape {:?}",
                bits.len(),
                shape
            )));
        }
        Ok(Self { shape, bits })
    }

    fn from_map(map: &CoordinateMap) -> Self {
        Self {
            shape: map.shape.clone(),
            bits: map.cells.iter().map(|&o| o != ABSENT).collect(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn get(&self, coord: &[usize]) -> bool {
        if coord.len() != self.shape.len() || coord.iter().zip(&self.shape).any(|(c, d)| c >= d) {
            return false;
        }
        let strides = row_major_strides(&self.shape);
        let linear: usize = coord.iter().zip(&strides).map(|(c, s)| c * s).sum();
        self.bits[linear]
    }

    pub fn count_live(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn fraction_live(&self) -> f64 {
        if self.bits.is_empty() {
            0.0
        } else {
            self.count_live() as f64 / self.bits.len() as f64
        }
    }

    /// Packed bit representation, least significant bit first
    pub fn to_packed(&self) -> Vec<u8> {
        pack_bits(&self.bits)
    }
}

/// Output of grid resolution; read-only for the rest of the pipeline
#[derive(Debug, Clone)]
pub struct ResolvedGrid {
    pub axes: Vec<Axis>,
    pub map: CoordinateMap,
    pub liveness: LivenessMask,
    pub collisions: Vec<Collision>,
    pub record_count: usize,
    pub sample_count: usize,
    pub data_type: DataType,
}

impl ResolvedGrid {
    pub fn shape(&self) -> &[usize] {
        self.map.shape()
    }

    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    pub fn live_count(&self) -> usize {
        self.map.live_cells()
    }

    /// Grid coordinate of a header key tuple
    pub fn coord_of_keys(&self, keys: &[i64]) -> Option<Vec<usize>> {
        if keys.len() != self.axes.len() {
            return None;
        }
        keys.iter()
            .zip(&self.axes)
            .map(|(&k, axis)| axis.rank_of(k))
            .collect()
    }
}

/// Resolves a [`HeaderIndex`] into a [`ResolvedGrid`]
#[derive(Debug, Clone)]
pub struct GridResolver {
    orderings: HashMap<String, AxisOrdering>,
    units: HashMap<String, String>,
    collision: CollisionPolicy,
    density_warn_threshold: f64,
}

impl Default for GridResolver {
    fn default() -> Self {
        Self {
            orderings: HashMap::new(),
            units: HashMap::new(),
            collision: CollisionPolicy::Fail,
            density_warn_threshold: 0.5,
        }
    }
}

impl GridResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ordering policy of one axis
    pub fn with_ordering(mut self, axis: impl Into<String>, ordering: AxisOrdering) -> Self {
        self.orderings.insert(axis.into(), ordering);
        self
    }

    /// Set the unit recorded for one axis
    pub fn with_unit(mut self, axis: impl Into<String>, unit: impl Into<String>) -> Self {
        self.units.insert(axis.into(), unit.into());
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision = policy;
        self
    }

    /// Live fraction below which a sparse-grid warning is logged
    pub fn with_density_warn_threshold(mut self, threshold: f64) -> Self {
        self.density_warn_threshold = threshold;
        self
    }

    /// Rank every axis, place every record and build the liveness mask
    pub fn resolve(&self, index: &HeaderIndex) -> Result<ResolvedGrid> {
        let axes = index
            .axis_names()
            .iter()
            .enumerate()
            .map(|(i, name)| self.rank_axis(name, index.distinct(i)))
            .collect::<Result<Vec<Axis>>>()?;

        let lookups: Vec<HashMap<i64, usize>> = axes
            .iter()
            .map(|a| a.values.iter().enumerate().map(|(r, &v)| (v, r)).collect())
            .collect();

        let shape: Vec<usize> = axes.iter().map(Axis::len).collect();
        let mut map = CoordinateMap::new(shape.clone())?;
        let mut collisions = Vec::new();
        debug!(shape = ?shape, cells = map.total_cells(), "resolving grid");

        for (row, &offset) in index.offsets().iter().enumerate() {
            if offset == ABSENT {
                return Err(IngestError::MalformedRecord {
                    offset,
                    reason: "offset is reserved".to_string(),
                });
            }

            let mut linear = 0;
            for (axis, lookup) in lookups.iter().enumerate() {
                let value = index.column(axis)[row];
                let rank = lookup.get(&value).ok_or_else(|| IngestError::InvalidAxis {
                    axis: axes[axis].name.clone(),
                    reason: format!("value {} has no rank", value),
                })?;
                linear += rank * map.strides[axis];
            }

            if let Some(first_offset) = map.insert(linear, offset) {
                let collision = Collision {
                    keys: index.keys(row),
                    coord: map.coord_of(linear),
                    first_offset,
                    second_offset: offset,
                };
                match self.collision {
                    CollisionPolicy::Fail => {
                        warn!(
                            keys = ?collision.keys,
                            first_offset,
                            second_offset = offset,
                            "duplicate coordinate"
                        );
                        return Err(IngestError::DuplicateCoordinate {
                            keys: collision.keys,
                            first_offset,
                            second_offset: offset,
                        });
                    }
                    CollisionPolicy::KeepFirst => {
                        map.cells[linear] = first_offset;
                        warn!(
                            keys = ?collision.keys,
                            kept = first_offset,
                            dropped = offset,
                            "duplicate coordinate resolved by keep-first"
                        );
                    }
                    CollisionPolicy::KeepLast => {
                        warn!(
                            keys = ?collision.keys,
                            kept = offset,
                            dropped = first_offset,
                            "duplicate coordinate resolved by keep-last"
                        );
                    }
                }
                collisions.push(collision);
            }
        }

        if !collisions.is_empty() {
            warn!(
                collisions = collisions.len(),
                policy = ?self.collision,
                "records were dropped while resolving duplicate coordinates"
            );
        }

        let liveness = LivenessMask::from_map(&map);
        let fraction = liveness.fraction_live();
        if fraction < self.density_warn_threshold {
            for axis in &axes {
                if let Some((min, max)) = axis.key_range() {
                    warn!(axis = %axis.name, min, max, "sparse grid axis range");
                }
            }
            warn!(
                shape = ?shape,
                live = map.live_cells(),
                fraction_live = fraction,
                threshold = self.density_warn_threshold,
                "proposed ingestion grid is sparse"
            );
        }

        info!(
            shape = ?shape,
            records = index.len(),
            live = map.live_cells(),
            fraction_live = fraction,
            "grid resolved"
        );

        Ok(ResolvedGrid {
            axes,
            map,
            liveness,
            collisions,
            record_count: index.len(),
            sample_count: index.sample_count(),
            data_type: index.data_type(),
        })
    }

    fn rank_axis(&self, name: &str, observed: &BTreeSet<i64>) -> Result<Axis> {
        let values: Vec<i64> = match self.orderings.get(name) {
            None | Some(AxisOrdering::Ascending) => observed.iter().copied().collect(),
            Some(AxisOrdering::Descending) => observed.iter().rev().copied().collect(),
            Some(AxisOrdering::Explicit(order)) => {
                let listed: BTreeSet<i64> = order.iter().copied().collect();
                if listed.len() != order.len() {
                    return Err(IngestError::InvalidAxis {
                        axis: name.to_string(),
                        reason: "explicit ordering lists a value twice".to_string(),
                    });
                }
                if let Some(unlisted) = observed.difference(&listed).next() {
                    return Err(IngestError::InvalidAxis {
                        axis: name.to_string(),
                        reason: format!("observed value {} missing from explicit ordering", unlisted),
                    });
                }
                let unobserved = listed.difference(observed).count();
                if unobserved > 0 {
                    info!(axis = name, unobserved, "explicit ordering lists unobserved values");
                }
                order.clone()
            }
        };
        let unit = self.units.get(name).cloned().unwrap_or_default();
        Ok(Axis::new(name, unit, values))
    }
}
