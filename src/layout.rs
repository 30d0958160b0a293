//! Chunk planning - how the grid is divided into independently stored chunks

use crate::error::{IngestError, Result};
use crate::grid::CoordinateMap;
use crate::types::DataType;
use crate::utils::{div_ceil, row_major_strides};
use std::ops::Range;

/// Default chunking for arrays without an explicit chunk shape.
///
/// Returns the grid chunk shape and the sample chunk length for an array of
/// `grid_rank` header axes plus the trailing sample axis.
pub fn default_chunking(grid_rank: usize) -> Result<(Vec<usize>, usize)> {
    match grid_rank + 1 {
        2 => Ok((vec![512], 512)),
        3 => Ok((vec![64, 64], 64)),
        dims => Err(IngestError::Configuration(format!(
            "no default chunking for {}-D arrays, specify a chunk shape",
            dims
        ))),
    }
}

/// One chunk of the plan with its actual (possibly clipped) extent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    /// Position in row-major plan order
    pub index: usize,
    /// Chunk coordinate, one entry per grid axis
    pub coord: Vec<usize>,
    /// Block index along the sample axis
    pub sample_block: usize,
    /// Grid cells covered along each axis
    pub extent: Vec<Range<usize>>,
    /// Samples covered within each trace
    pub samples: Range<usize>,
}

impl PlannedChunk {
    /// Grid cells covered along each axis
    pub fn shape(&self) -> Vec<usize> {
        self.extent.iter().map(|r| r.end - r.start).collect()
    }

    pub fn cell_count(&self) -> usize {
        self.extent.iter().map(|r| r.end - r.start).product()
    }

    pub fn sample_len(&self) -> usize {
        self.samples.end - self.samples.start
    }

    /// Global grid coordinate of a local cell index
    pub fn global_coord(&self, local: usize) -> Vec<usize> {
        let strides = row_major_strides(&self.shape());
        let mut rest = local;
        self.extent
            .iter()
            .zip(&strides)
            .map(|(range, stride)| {
                let c = rest / stride;
                rest %= stride;
                range.start + c
            })
            .collect()
    }

    /// Whether a global grid coordinate falls inside this chunk
    pub fn contains(&self, grid_coord: &[usize]) -> bool {
        grid_coord.len() == self.extent.len()
            && grid_coord.iter().zip(&self.extent).all(|(c, r)| r.contains(c))
    }

    /// Live cells inside this chunk as `(local cell index, source offset)`
    pub fn live_cells<'a>(
        &'a self,
        map: &'a CoordinateMap,
    ) -> impl Iterator<Item = (usize, u64)> + 'a {
        (0..self.cell_count()).filter_map(move |local| {
            let global = self.global_coord(local);
            map.get(&global).map(|offset| (local, offset))
        })
    }
}

/// Partition of a grid (plus sample axis) into fixed-shape chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    grid_shape: Vec<usize>,
    chunk_shape: Vec<usize>,
    sample_count: usize,
    sample_chunk: usize,
}

impl ChunkPlan {
    /// Plan chunks of `chunk_shape` over `grid_shape`; traces are kept whole
    pub fn new(grid_shape: &[usize], chunk_shape: &[usize]) -> Result<Self> {
        if grid_shape.len() != chunk_shape.len() {
            return Err(IngestError::InvalidDimensions(format!(
                "chunk shape {:?} does not match grid rank {}",
                chunk_shape,
                grid_shape.len()
            )));
        }
        if grid_shape.is_empty() {
            return Err(IngestError::InvalidDimensions(
                "grid must have at least one axis".to_string(),
            ));
        }
        if let Some(axis) = chunk_shape.iter().position(|&c| c == 0) {
            return Err(IngestError::InvalidDimensions(format!(
                "chunk length along axis {} must be positive",
                axis
            )));
        }
        if let Some(axis) = grid_shape.iter().position(|&g| g == 0) {
            return Err(IngestError::InvalidDimensions(format!(
                "grid axis {} is empty",
                axis
            )));
        }

        Ok(Self {
            grid_shape: grid_shape.to_vec(),
            chunk_shape: chunk_shape.to_vec(),
            sample_count: 0,
            sample_chunk: 1,
        })
    }

    /// Set the trace length and, optionally, split the sample axis into blocks
    pub fn with_samples(mut self, sample_count: usize, sample_chunk: Option<usize>) -> Result<Self> {
        let sample_chunk = match sample_chunk {
            Some(0) => {
                return Err(IngestError::InvalidDimensions(
                    "sample chunk length must be positive".to_string(),
                ))
            }
            Some(c) => c.min(sample_count.max(1)),
            None => sample_count.max(1),
        };
        self.sample_count = sample_count;
        self.sample_chunk = sample_chunk;
        Ok(self)
    }

    pub fn grid_shape(&self) -> &[usize] {
        &self.grid_shape
    }

    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunk_shape
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn sample_chunk(&self) -> usize {
        self.sample_chunk
    }

    /// Number of chunks along each grid axis
    pub fn chunk_count(&self) -> Vec<usize> {
        self.grid_shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&g, &c)| div_ceil(g, c))
            .collect()
    }

    /// Number of blocks along the sample axis
    pub fn sample_blocks(&self) -> usize {
        if self.sample_count == 0 {
            1
        } else {
            div_ceil(self.sample_count, self.sample_chunk)
        }
    }

    /// Get the total number of chunks
    pub fn total_chunks(&self) -> usize {
        self.chunk_count().iter().product::<usize>() * self.sample_blocks()
    }

    /// Convert a plan index to chunk coordinates and sample block
    pub fn index_to_coords(&self, index: usize) -> (Vec<usize>, usize) {
        let blocks = self.sample_blocks();
        let sample_block = index % blocks;
        let mut remaining = index / blocks;

        let strides = row_major_strides(&self.chunk_count());
        let coords = strides
            .iter()
            .map(|stride| {
                let c = remaining / stride;
                remaining %= stride;
                c
            })
            .collect();
        (coords, sample_block)
    }

    /// Convert chunk coordinates and sample block to a plan index
    pub fn coords_to_index(&self, coords: &[usize], sample_block: usize) -> usize {
        let strides = row_major_strides(&self.chunk_count());
        let grid_index: usize = coords.iter().zip(&strides).map(|(c, s)| c * s).sum();
        grid_index * self.sample_blocks() + sample_block
    }

    /// Grid cells covered by a chunk, clipped at the upper boundary
    pub fn chunk_extent(&self, coords: &[usize]) -> Vec<Range<usize>> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &coord)| {
                let start = coord * self.chunk_shape[i];
                let end = (start + self.chunk_shape[i]).min(self.grid_shape[i]);
                start..end
            })
            .collect()
    }

    /// Chunk at a plan index
    pub fn chunk(&self, index: usize) -> Option<PlannedChunk> {
        if index >= self.total_chunks() {
            return None;
        }
        let (coord, sample_block) = self.index_to_coords(index);
        let start = sample_block * self.sample_chunk;
        let end = (start + self.sample_chunk).min(self.sample_count);
        Some(PlannedChunk {
            index,
            extent: self.chunk_extent(&coord),
            coord,
            sample_block,
            samples: start.min(end)..end,
        })
    }

    /// Every chunk in deterministic row-major order (sample block fastest)
    pub fn iter(&self) -> impl Iterator<Item = PlannedChunk> + '_ {
        (0..self.total_chunks()).filter_map(move |i| self.chunk(i))
    }

    /// Uncompressed size of the largest chunk
    pub fn chunk_bytes(&self, data_type: DataType) -> usize {
        let cells: usize = self
            .grid_shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&g, &c)| g.min(c))
            .product();
        cells * self.sample_chunk.min(self.sample_count) * data_type.size_in_bytes()
    }

    /// Get a summary string of the plan
    pub fn summary(&self) -> String {
        let join = |v: &[usize]| {
            v.iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" x ")
        };
        format!(
            "grid {} x {} samples, chunks {} x {}, {} chunks",
            join(&self.grid_shape),
            self.sample_count,
            join(&self.chunk_shape),
            self.sample_chunk,
            self.total_chunks()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridResolver;
    use crate::header_index::HeaderIndex;

    #[test]
    fn test_two_chunks_along_axis_zero() {
        let plan = ChunkPlan::new(&[3, 2], &[2, 2]).unwrap();
        assert_eq!(plan.chunk_count(), vec![2, 1]);
        let chunks: Vec<PlannedChunk> = plan.iter().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].coord, vec![0, 0]);
        assert_eq!(chunks[0].shape(), vec![2, 2]);
        assert_eq!(chunks[1].coord, vec![1, 0]);
        assert_eq!(chunks[1].shape(), vec![1, 2]);
        assert_eq!(chunks[1].extent, vec![2..3, 0..2]);
        assert!(chunks[1].contains(&[2, 1]));
        assert!(!chunks[1].contains(&[1, 1]));
        assert!(!chunks[1].contains(&[2]));
    }

    #[test]
    fn test_partial_chunks_on_every_axis() {
        let plan = ChunkPlan::new(&[1000, 800], &[64, 64])
            .unwrap()
            .with_samples(500, Some(64))
            .unwrap();
        assert_eq!(plan.chunk_count(), vec![16, 13]);
        assert_eq!(plan.sample_blocks(), 8);
        assert_eq!(plan.total_chunks(), 16 * 13 * 8);

        let last = plan.chunk(plan.total_chunks() - 1).unwrap();
        assert_eq!(last.coord, vec![15, 12]);
        assert_eq!(last.sample_block, 7);
        assert_eq!(last.extent, vec![960..1000, 768..800]);
        assert_eq!(last.samples, 448..500);
        assert!(plan.chunk(plan.total_chunks()).is_none());
    }

    #[test]
    fn test_index_conversion() {
        let plan = ChunkPlan::new(&[100, 50, 7], &[10, 8, 3])
            .unwrap()
            .with_samples(30, Some(16))
            .unwrap();
        let index = plan.coords_to_index(&[5, 3, 1], 1);
        assert_eq!(plan.index_to_coords(index), (vec![5, 3, 1], 1));
        for (i, chunk) in plan.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(ChunkPlan::new(&[3, 2], &[2]).is_err());
        assert!(ChunkPlan::new(&[3, 2], &[2, 0]).is_err());
        assert!(ChunkPlan::new(&[], &[]).is_err());
        assert!(ChunkPlan::new(&[3], &[1]).unwrap().with_samples(10, Some(0)).is_err());
    }

    #[test]
    fn test_live_cells_within_chunk() {
        let index = HeaderIndex::from_columns(
            vec!["inline".into(), "crossline".into()],
            vec![vec![100, 100, 101, 101, 102], vec![10, 11, 10, 11, 10]],
            vec![0, 1, 2, 3, 4],
            4,
            DataType::F32,
        )
        .unwrap();
        let grid = GridResolver::new().resolve(&index).unwrap();
        let plan = ChunkPlan::new(grid.shape(), &[2, 2]).unwrap();

        let first = plan.chunk(0).unwrap();
        let live: Vec<(usize, u64)> = first.live_cells(&grid.map).collect();
        assert_eq!(live, vec![(0, 0), (1, 1), (2, 2), (3, 3)]);

        let second = plan.chunk(1).unwrap();
        let live: Vec<(usize, u64)> = second.live_cells(&grid.map).collect();
        assert_eq!(live, vec![(0, 4)]);
        assert_eq!(second.global_coord(1), vec![2, 1]);
    }

    #[test]
    fn test_default_chunking() {
        assert_eq!(default_chunking(1).unwrap(), (vec![512], 512));
        assert_eq!(default_chunking(2).unwrap(), (vec![64, 64], 64));
        assert!(default_chunking(3).is_err());
    }

    #[test]
    fn test_chunk_bytes() {
        let plan = ChunkPlan::new(&[3, 2], &[2, 2])
            .unwrap()
            .with_samples(100, None)
            .unwrap();
        assert_eq!(plan.sample_blocks(), 1);
        assert_eq!(plan.chunk_bytes(DataType::F32), 4 * 100 * 4);
    }
}
