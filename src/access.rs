//! Volume access - reading a finished store back

use crate::compression::{decompress_blocking, CodecSpec};
use crate::error::{IngestError, Result};
use crate::grid::LivenessMask;
use crate::layout::ChunkPlan;
use crate::metadata::{ArrayDescriptor, FormatVersion, StoreDescriptor};
use crate::store::ArrayStore;
use crate::types::{DataType, SampleBuffer};
use crate::utils::{chunk_key, row_major_strides, unpack_bits};
use futures::future::try_join_all;
use ndarray::{ArrayD, IxDyn};
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::Arc;

/// One decoded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    pub coord: Vec<usize>,
    pub sample_block: usize,
    /// Grid cells covered along each axis
    pub extent: Vec<Range<usize>>,
    /// Samples covered within each trace
    pub samples: Range<usize>,
    /// Cell-major sample values
    pub data: SampleBuffer,
    pub liveness: Vec<bool>,
}

impl ChunkData {
    /// Samples of one local cell
    pub fn cell(&self, local: usize) -> &[u8] {
        let cell_bytes = (self.samples.end - self.samples.start) * self.data.data_type().size_in_bytes();
        &self.data.bytes()[local * cell_bytes..(local + 1) * cell_bytes]
    }
}

/// Read interface over a completed store
pub struct VolumeReader {
    store: ArrayStore,
    array_name: String,
    descriptor: Arc<RwLock<StoreDescriptor>>,
}

impl VolumeReader {
    /// Open the single array of a store; `NotFound` if the store is incomplete
    pub async fn open(store: ArrayStore) -> Result<Self> {
        let descriptor = store.read_descriptor().await?;
        check_version(&descriptor)?;
        let array_name = descriptor
            .arrays
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| IngestError::Metadata("descriptor lists no arrays".to_string()))?;
        Ok(Self {
            store,
            array_name,
            descriptor: Arc::new(RwLock::new(descriptor)),
        })
    }

    /// Open a store from a URL
    pub async fn open_url(url: &str) -> Result<Self> {
        Self::open(ArrayStore::open(url).await?).await
    }

    /// Re-read the descriptor after the store was rewritten
    pub async fn refresh(&self) -> Result<()> {
        let descriptor = self.store.read_descriptor().await?;
        check_version(&descriptor)?;
        *self.descriptor.write() = descriptor;
        Ok(())
    }

    pub fn descriptor(&self) -> StoreDescriptor {
        self.descriptor.read().clone()
    }

    pub fn array_name(&self) -> &str {
        &self.array_name
    }

    fn array(&self) -> Result<ArrayDescriptor> {
        self.descriptor
            .read()
            .arrays
            .get(&self.array_name)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(format!("array '{}'", self.array_name)))
    }

    /// Chunk plan the store was written with
    pub fn plan(&self) -> Result<ChunkPlan> {
        let descriptor = self.descriptor.read();
        ChunkPlan::new(&descriptor.grid_shape, &descriptor.chunk_shape)?
            .with_samples(descriptor.sample_axis.count, Some(descriptor.sample_chunk))
    }

    /// Read, verify and decompress one chunk
    pub async fn read_chunk(&self, coord: &[usize], sample_block: usize) -> Result<ChunkData> {
        let plan = self.plan()?;
        let array = self.array()?;
        let index = chunk_index(&plan, coord, sample_block)?;
        let chunk = plan
            .chunk(index)
            .ok_or_else(|| IngestError::NotFound(format!("chunk {:?}/{}", coord, sample_block)))?;

        let key = chunk_key(&self.array_name, coord, sample_block);
        let stored = self.store.read_chunk(&key).await?;
        let cells = chunk.cell_count();
        let liveness = unpack_bits(&stored.liveness, cells).ok_or_else(|| {
            IngestError::Metadata(format!("liveness of '{}' does not cover {} cells", key, cells))
        })?;

        let bytes = decompress_blocking(array.codec, array.data_type, stored.payload).await?;
        let expected = cells * chunk.sample_len() * array.data_type.size_in_bytes();
        if bytes.len() != expected {
            return Err(IngestError::Decompression(format!(
                "'{}' holds {} bytes, expected {}",
                key,
                bytes.len(),
                expected
            )));
        }

        Ok(ChunkData {
            coord: chunk.coord,
            sample_block,
            extent: chunk.extent,
            samples: chunk.samples,
            data: SampleBuffer::from_bytes(array.data_type, bytes)?,
            liveness,
        })
    }

    /// Samples of one grid cell, `None` for absent cells
    pub async fn read_trace(&self, grid_coord: &[usize]) -> Result<Option<SampleBuffer>> {
        let plan = self.plan()?;
        let array = self.array()?;
        check_bounds(plan.grid_shape(), grid_coord)?;

        let coord: Vec<usize> = grid_coord
            .iter()
            .zip(plan.chunk_shape())
            .map(|(g, c)| g / c)
            .collect();
        let reads = (0..plan.sample_blocks()).map(|block| self.read_chunk(&coord, block));
        let chunks = try_join_all(reads).await?;

        let mut trace = Vec::with_capacity(plan.sample_count() * array.data_type.size_in_bytes());
        for chunk in &chunks {
            let local = local_index(&chunk.extent, grid_coord);
            if !chunk.liveness[local] {
                return Ok(None);
            }
            trace.extend_from_slice(chunk.cell(local));
        }
        SampleBuffer::from_bytes(array.data_type, trace).map(Some)
    }

    /// The whole array as `f64`, grid axes followed by the sample axis
    pub async fn read_volume_f64(&self) -> Result<ArrayD<f64>> {
        let plan = self.plan()?;
        let array = self.array()?;
        let sample_count = plan.sample_count();
        let mut shape = plan.grid_shape().to_vec();
        shape.push(sample_count);
        let total: usize = shape.iter().product();
        let mut values = vec![array.fill_value; total];

        let strides = row_major_strides(plan.grid_shape());
        let reads = plan
            .iter()
            .map(|chunk| self.read_chunk_owned(chunk.coord, chunk.sample_block));
        for chunk in try_join_all(reads).await? {
            let samples = chunk.data.to_f64_vec();
            let sample_len = chunk.samples.end - chunk.samples.start;
            let local_shape: Vec<usize> = chunk.extent.iter().map(|r| r.end - r.start).collect();
            let local_strides = row_major_strides(&local_shape);

            for local in 0..chunk.liveness.len() {
                let mut rest = local;
                let mut linear = 0;
                for ((range, ls), gs) in chunk.extent.iter().zip(&local_strides).zip(&strides) {
                    linear += (range.start + rest / ls) * gs;
                    rest %= ls;
                }
                let dst = linear * sample_count + chunk.samples.start;
                let src = local * sample_len;
                values[dst..dst + sample_len].copy_from_slice(&samples[src..src + sample_len]);
            }
        }

        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| IngestError::InvalidDimensions(e.to_string()))
    }

    async fn read_chunk_owned(&self, coord: Vec<usize>, sample_block: usize) -> Result<ChunkData> {
        self.read_chunk(&coord, sample_block).await
    }

    /// Global liveness mask
    pub async fn live_mask(&self) -> Result<LivenessMask> {
        self.store.read_live_mask().await
    }

    /// Get statistics about the store
    pub fn get_stats(&self) -> Result<VolumeStats> {
        let descriptor = self.descriptor();
        let array = self.array()?;
        let plan = self.plan()?;
        Ok(VolumeStats {
            dimensionality: descriptor.grid_shape.len() + 1,
            total_cells: descriptor.liveness.total_cells,
            live_cells: descriptor.liveness.live_cells,
            total_chunks: plan.total_chunks(),
            uncompressed_size: descriptor.array_shape().iter().product::<usize>()
                * array.data_type.size_in_bytes(),
            data_type: array.data_type,
            codec: array.codec,
        })
    }
}

fn check_version(descriptor: &StoreDescriptor) -> Result<()> {
    if !descriptor.version.is_compatible(&FormatVersion::CURRENT) {
        return Err(IngestError::Metadata(format!(
            "store format {}.{} is not readable by format {}.{}",
            descriptor.version.major,
            descriptor.version.minor,
            FormatVersion::CURRENT.major,
            FormatVersion::CURRENT.minor
        )));
    }
    Ok(())
}

fn check_bounds(shape: &[usize], coord: &[usize]) -> Result<()> {
    if coord.len() != shape.len() || coord.iter().zip(shape).any(|(c, s)| c >= s) {
        return Err(IngestError::InvalidDimensions(format!(
            "coordinate {:?} outside grid {:?}",
            coord, shape
        )));
    }
    Ok(())
}

fn chunk_index(plan: &ChunkPlan, coord: &[usize], sample_block: usize) -> Result<usize> {
    check_bounds(&plan.chunk_count(), coord)?;
    if sample_block >= plan.sample_blocks() {
        return Err(IngestError::InvalidDimensions(format!(
            "sample block {} of {}",
            sample_block,
            plan.sample_blocks()
        )));
    }
    Ok(plan.coords_to_index(coord, sample_block))
}

fn local_index(extent: &[Range<usize>], grid_coord: &[usize]) -> usize {
    let shape: Vec<usize> = extent.iter().map(|r| r.end - r.start).collect();
    let strides = row_major_strides(&shape);
    grid_coord
        .iter()
        .zip(extent)
        .zip(&strides)
        .map(|((g, r), s)| (g - r.start) * s)
        .sum()
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct VolumeStats {
    pub dimensionality: usize,
    pub total_cells: usize,
    pub live_cells: usize,
    pub total_chunks: usize,
    pub uncompressed_size: usize,
    pub data_type: DataType,
    pub codec: CodecSpec,
}

impl VolumeStats {
    pub fn summary(&self) -> String {
        format!(
            "{}D store: {}/{} live cells, {} chunks, {} uncompressed ({:?}, {:?})",
            self.dimensionality,
            self.live_cells,
            self.total_cells,
            self.total_chunks,
            crate::utils::format_bytes(self.uncompressed_size),
            self.data_type,
            self.codec.method,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::ingest::Ingestor;
    use crate::io::MemoryIOManager;
    use crate::record::{MemoryRecordSource, Record};

    #[tokio::test]
    async fn test_open_incomplete_store() {
        let store = ArrayStore::new(Arc::new(MemoryIOManager::new()));
        assert!(matches!(
            VolumeReader::open(store).await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_incompatible_format() {
        let store = ArrayStore::new(Arc::new(MemoryIOManager::new()));
        let records = (0..4u64)
            .map(|i| {
                Record::new(
                    i,
                    [("inline", (i / 2) as i64), ("crossline", (i % 2) as i64)],
                    SampleBuffer::from_samples(&[i as f32; 3]),
                )
            })
            .collect();
        Ingestor::with_store(IngestConfig::default(), store.clone())
            .run(Arc::new(MemoryRecordSource::new(records)))
            .await
            .unwrap();

        let reader = VolumeReader::open(store.clone()).await.unwrap();
        let mut descriptor = reader.descriptor();
        assert_eq!(descriptor.version, FormatVersion::CURRENT);

        descriptor.version = FormatVersion::new(FormatVersion::CURRENT.major + 1, 0);
        store.write_descriptor(&descriptor).await.unwrap();
        assert!(matches!(reader.refresh().await, Err(IngestError::Metadata(_))));
        assert!(matches!(
            VolumeReader::open(store).await,
            Err(IngestError::Metadata(_))
        ));
    }

    #[test]
    fn test_local_index() {
        let extent = vec![2..4, 4..7];
        assert_eq!(local_index(&extent, &[2, 4]), 0);
        assert_eq!(local_index(&extent, &[3, 6]), 5);
    }

    #[test]
    fn test_bounds() {
        assert!(check_bounds(&[3, 2], &[2, 1]).is_ok());
        assert!(check_bounds(&[3, 2], &[3, 0]).is_err());
        assert!(check_bounds(&[3, 2], &[0]).is_err());
    }
}
