//! Chunk writer - assembles, compresses and persists one planned chunk

use crate::compression::{compress_blocking, decompress_blocking, CodecSpec};
use crate::error::{IngestError, Result};
use crate::grid::ResolvedGrid;
use crate::layout::PlannedChunk;
use crate::record::RecordSource;
use crate::stats::SampleStats;
use crate::store::ArrayStore;
use crate::types::{DataType, SampleBuffer};
use crate::utils::{chunk_key, pack_bits, unpack_bits};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-array settings of the chunk writer
#[derive(Debug, Clone, PartialEq)]
pub struct WriterSettings {
    pub array_name: String,
    pub codec: CodecSpec,
    /// Value stored at absent cells
    pub fill_value: f64,
    /// Mark cells absent instead of failing when their samples cannot be read
    pub best_effort: bool,
    /// Concurrent trace reads within one chunk
    pub read_concurrency: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            array_name: "seismic".to_string(),
            codec: CodecSpec::default(),
            fill_value: 0.0,
            best_effort: false,
            read_concurrency: 16,
        }
    }
}

/// Outcome of writing (or recovering) one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    pub index: usize,
    pub coord: Vec<usize>,
    pub sample_block: usize,
    pub key: String,
    pub live_cells: usize,
    pub total_cells: usize,
    pub raw_bytes: usize,
    pub stored_bytes: usize,
    /// Statistics over the live cells of this chunk
    pub stats: SampleStats,
    /// Global coordinates of grid cells dropped for unreadable samples
    pub degraded: Vec<Vec<usize>>,
    /// Read back from an earlier run rather than written
    pub recovered: bool,
}

/// Uncompressed chunk contents
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledChunk {
    /// Cells in row-major order, each holding the chunk's sample block
    pub data: Vec<u8>,
    pub liveness: Vec<bool>,
    pub degraded: Vec<Vec<usize>>,
}

pub struct ChunkWriter {
    source: Arc<dyn RecordSource>,
    store: ArrayStore,
    grid: Arc<ResolvedGrid>,
    settings: WriterSettings,
    fill: Vec<u8>,
}

impl ChunkWriter {
    pub fn new(
        source: Arc<dyn RecordSource>,
        store: ArrayStore,
        grid: Arc<ResolvedGrid>,
        settings: WriterSettings,
    ) -> Result<Self> {
        settings.codec.validate(grid.data_type)?;
        settings.codec.validate_fill(settings.fill_value)?;
        let fill = grid.data_type.encode_f64(settings.fill_value)?;
        Ok(Self {
            source,
            store,
            grid,
            settings,
            fill,
        })
    }

    pub fn store(&self) -> &ArrayStore {
        &self.store
    }

    pub fn grid(&self) -> &ResolvedGrid {
        &self.grid
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    pub fn data_type(&self) -> DataType {
        self.grid.data_type
    }

    pub fn chunk_key(&self, chunk: &PlannedChunk) -> String {
        chunk_key(&self.settings.array_name, &chunk.coord, chunk.sample_block)
    }

    /// Assemble, compress and persist one chunk.
    ///
    /// The stored object depends only on the chunk, the grid and the source,
    /// so rewriting a chunk produces byte-identical output.
    pub async fn write(&self, chunk: &PlannedChunk) -> Result<ChunkReport> {
        self.write_excluding(chunk, &BTreeSet::new()).await
    }

    /// Like [`ChunkWriter::write`], storing the grid cells in `excluded` as
    /// absent and reporting them as degraded
    pub async fn write_excluding(
        &self,
        chunk: &PlannedChunk,
        excluded: &BTreeSet<Vec<usize>>,
    ) -> Result<ChunkReport> {
        let assembled = self.assemble(chunk, excluded).await?;
        let stats = self.live_stats(chunk, &assembled.data, &assembled.liveness);
        let raw_bytes = assembled.data.len();
        let live_cells = assembled.liveness.iter().filter(|&&l| l).count();

        let compressed = compress_blocking(self.settings.codec, self.data_type(), assembled.data).await?;
        let key = self.chunk_key(chunk);
        let stored_bytes = self
            .store
            .write_chunk(&key, &compressed, &pack_bits(&assembled.liveness))
            .await?;

        debug!(
            coord = ?chunk.coord,
            sample_block = chunk.sample_block,
            live_cells,
            raw_bytes,
            stored_bytes,
            "chunk stored"
        );

        Ok(ChunkReport {
            index: chunk.index,
            coord: chunk.coord.clone(),
            sample_block: chunk.sample_block,
            key,
            live_cells,
            total_cells: chunk.cell_count(),
            raw_bytes,
            stored_bytes,
            stats,
            degraded: assembled.degraded,
            recovered: false,
        })
    }

    /// Build the uncompressed buffer and liveness slice of a chunk.
    ///
    /// Live cells listed in `excluded` are not read; they keep the fill value
    /// and are reported as degraded.
    pub async fn assemble(
        &self,
        chunk: &PlannedChunk,
        excluded: &BTreeSet<Vec<usize>>,
    ) -> Result<AssembledChunk> {
        let width = self.data_type().size_in_bytes();
        let cell_bytes = chunk.sample_len() * width;
        let cells = chunk.cell_count();
        let mut data = self.fill.repeat(cells * chunk.sample_len());
        let mut liveness = vec![false; cells];
        let mut degraded = Vec::new();

        let mut live = Vec::new();
        for (local, offset) in chunk.live_cells(&self.grid.map) {
            let coord = chunk.global_coord(local);
            if excluded.contains(&coord) {
                degraded.push(coord);
            } else {
                live.push((local, offset));
            }
        }
        let mut reads = stream::iter(live)
            .map(|(local, offset)| async move { (local, offset, self.read_trace(offset).await) })
            .buffer_unordered(self.settings.read_concurrency.max(1));

        let block = chunk.samples.start * width..chunk.samples.end * width;
        while let Some((local, offset, result)) = reads.next().await {
            match result {
                Ok(trace) => {
                    let start = local * cell_bytes;
                    data[start..start + cell_bytes].copy_from_slice(&trace.bytes()[block.clone()]);
                    liveness[local] = true;
                }
                Err(err) if self.settings.best_effort => {
                    let coord = chunk.global_coord(local);
                    warn!(offset, coord = ?coord, error = %err, "unreadable trace marked absent");
                    degraded.push(coord);
                }
                Err(err) => return Err(err),
            }
        }
        degraded.sort();

        Ok(AssembledChunk {
            data,
            liveness,
            degraded,
        })
    }

    /// Rebuild the report of a chunk stored by an earlier run
    pub async fn recover(&self, chunk: &PlannedChunk) -> Result<ChunkReport> {
        let key = self.chunk_key(chunk);
        let stored = self.store.read_chunk(&key).await?;
        let stored_bytes = self.store.io().size(&key).await?;

        let cells = chunk.cell_count();
        let liveness = unpack_bits(&stored.liveness, cells).ok_or_else(|| {
            IngestError::Metadata(format!("liveness of '{}' does not cover {} cells", key, cells))
        })?;
        let data = decompress_blocking(self.settings.codec, self.data_type(), stored.payload).await?;
        let expected = cells * chunk.sample_len() * self.data_type().size_in_bytes();
        if data.len() != expected {
            return Err(IngestError::Decompression(format!(
                "'{}' holds {} bytes, expected {}",
                key,
                data.len(),
                expected
            )));
        }

        let degraded = chunk
            .live_cells(&self.grid.map)
            .filter(|&(local, _)| !liveness[local])
            .map(|(local, _)| chunk.global_coord(local))
            .collect();

        Ok(ChunkReport {
            index: chunk.index,
            coord: chunk.coord.clone(),
            sample_block: chunk.sample_block,
            key,
            live_cells: liveness.iter().filter(|&&l| l).count(),
            total_cells: cells,
            raw_bytes: data.len(),
            stored_bytes,
            stats: self.live_stats(chunk, &data, &liveness),
            degraded,
            recovered: true,
        })
    }

    async fn read_trace(&self, offset: u64) -> Result<SampleBuffer> {
        let trace = self.source.read_samples(offset).await?;
        if trace.data_type() != self.grid.data_type || trace.len() != self.grid.sample_count {
            return Err(IngestError::RecordRead {
                offset,
                reason: format!(
                    "expected {} {} samples, got {} {}",
                    self.grid.sample_count,
                    self.grid.data_type,
                    trace.len(),
                    trace.data_type()
                ),
            });
        }
        Ok(trace)
    }

    fn live_stats(&self, chunk: &PlannedChunk, data: &[u8], liveness: &[bool]) -> SampleStats {
        let data_type = self.data_type();
        let width = data_type.size_in_bytes();
        let cell_bytes = chunk.sample_len() * width;
        let mut stats = SampleStats::new();
        if cell_bytes == 0 {
            return stats;
        }
        for (cell, _) in data.chunks_exact(cell_bytes).zip(liveness).filter(|(_, &live)| live) {
            stats.extend(cell.chunks_exact(width).map(|b| data_type.decode_f64(b)));
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridResolver;
    use crate::header_index::HeaderIndex;
    use crate::io::MemoryIOManager;
    use crate::layout::ChunkPlan;
    use crate::record::{MemoryRecordSource, Record};
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    const CELLS: [(i64, i64); 5] = [(100, 10), (100, 11), (101, 10), (101, 11), (102, 10)];

    fn source() -> MemoryRecordSource {
        MemoryRecordSource::new(
            CELLS
                .iter()
                .enumerate()
                .map(|(i, &(il, xl))| {
                    Record::new(
                        i as u64,
                        [("inline", il), ("crossline", xl)],
                        SampleBuffer::from_samples(&[il as f32, xl as f32, i as f32]),
                    )
                })
                .collect(),
        )
    }

    fn grid() -> Arc<ResolvedGrid> {
        let index = HeaderIndex::from_columns(
            vec!["inline".into(), "crossline".into()],
            vec![
                CELLS.iter().map(|c| c.0).collect(),
                CELLS.iter().map(|c| c.1).collect(),
            ],
            (0..CELLS.len() as u64).collect(),
            3,
            DataType::F32,
        )
        .unwrap();
        Arc::new(GridResolver::new().resolve(&index).unwrap())
    }

    fn writer(source: Arc<dyn RecordSource>, settings: WriterSettings) -> ChunkWriter {
        let store = ArrayStore::new(Arc::new(MemoryIOManager::new()));
        ChunkWriter::new(source, store, grid(), settings).unwrap()
    }

    fn plan() -> ChunkPlan {
        ChunkPlan::new(&[3, 2], &[2, 2]).unwrap().with_samples(3, None).unwrap()
    }

    #[tokio::test]
    async fn test_partial_chunk_is_filled() {
        let settings = WriterSettings {
            fill_value: -1.0,
            ..Default::default()
        };
        let writer = writer(Arc::new(source()), settings);
        let chunk = plan().chunk(1).unwrap();

        let assembled = writer.assemble(&chunk, &BTreeSet::new()).await.unwrap();
        assert_eq!(assembled.liveness, vec![true, false]);
        let values = SampleBuffer::from_bytes(DataType::F32, assembled.data)
            .unwrap()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(values, vec![102.0, 10.0, 4.0, -1.0, -1.0, -1.0]);

        let report = writer.write(&chunk).await.unwrap();
        assert_eq!(report.key, "seismic/c/1/0/0");
        assert_eq!(report.live_cells, 1);
        assert_eq!(report.total_cells, 2);
        assert_eq!(report.stats.count, 3);
        assert_eq!(report.stats.max, 102.0);
    }

    #[tokio::test]
    async fn test_rewrite_is_byte_identical() {
        let writer = writer(Arc::new(source()), WriterSettings::default());
        let chunk = plan().chunk(0).unwrap();

        writer.write(&chunk).await.unwrap();
        let first = writer.store().io().read("seismic/c/0/0/0").await.unwrap();
        writer.write(&chunk).await.unwrap();
        let second = writer.store().io().read("seismic/c/0/0/0").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sample_blocks() {
        let plan = ChunkPlan::new(&[3, 2], &[2, 2]).unwrap().with_samples(3, Some(2)).unwrap();
        let writer = writer(Arc::new(source()), WriterSettings::default());

        let tail = plan.chunk(1).unwrap();
        assert_eq!(tail.samples, 2..3);
        let assembled = writer.assemble(&tail, &BTreeSet::new()).await.unwrap();
        let values = SampleBuffer::from_bytes(DataType::F32, assembled.data)
            .unwrap()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_recover_matches_write() {
        let writer = writer(Arc::new(source()), WriterSettings::default());
        for chunk in plan().iter() {
            let written = writer.write(&chunk).await.unwrap();
            let recovered = writer.recover(&chunk).await.unwrap();
            assert!(recovered.recovered);
            assert_eq!(recovered.stats, written.stats);
            assert_eq!(recovered.live_cells, written.live_cells);
            assert_eq!(recovered.stored_bytes, written.stored_bytes);
        }
    }

    struct FailingSource {
        inner: MemoryRecordSource,
        bad_offset: u64,
    }

    #[async_trait]
    impl RecordSource for FailingSource {
        fn decode(&self) -> BoxStream<'_, Result<Record>> {
            self.inner.decode()
        }

        async fn read_samples(&self, offset: u64) -> Result<SampleBuffer> {
            if offset == self.bad_offset {
                return Err(IngestError::RecordRead {
                    offset,
                    reason: "bad sector".to_string(),
                });
            }
            self.inner.read_samples(offset).await
        }
    }

    #[tokio::test]
    async fn test_read_failure_policy() {
        let failing = Arc::new(FailingSource {
            inner: source(),
            bad_offset: 3,
        });
        let chunk = plan().chunk(0).unwrap();

        let strict = writer(failing.clone(), WriterSettings::default());
        assert!(matches!(
            strict.write(&chunk).await,
            Err(IngestError::RecordRead { offset: 3, .. })
        ));

        let lenient = writer(
            failing,
            WriterSettings {
                best_effort: true,
                ..Default::default()
            },
        );
        let report = lenient.write(&chunk).await.unwrap();
        assert_eq!(report.live_cells, 3);
        assert_eq!(report.degraded, vec![vec![1, 1]]);
    }

    #[tokio::test]
    async fn test_mismatched_trace_is_a_read_failure() {
        let mut records = source();
        records.push(Record::new(
            9,
            [("inline", 0), ("crossline", 0)],
            SampleBuffer::from_samples(&[1i16, 2, 3]),
        ));
        let writer = writer(Arc::new(records), WriterSettings::default());
        assert!(writer.read_trace(9).await.is_err());
        assert!(writer.read_trace(0).await.is_ok());
    }

    #[test]
    fn test_invalid_codec_for_type() {
        let store = ArrayStore::new(Arc::new(MemoryIOManager::new()));
        let settings = WriterSettings {
            fill_value: f64::NAN,
            ..Default::default()
        };
        // NaN is representable in f32
        assert!(ChunkWriter::new(Arc::new(source()), store.clone(), grid(), settings).is_ok());

        let settings = WriterSettings {
            codec: CodecSpec::quantized(0.0),
            ..Default::default()
        };
        assert!(ChunkWriter::new(Arc::new(source()), store.clone(), grid(), settings).is_err());

        let settings = WriterSettings {
            codec: CodecSpec::quantized(0.01),
            fill_value: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(
            ChunkWriter::new(Arc::new(source()), store, grid(), settings),
            Err(IngestError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_excluded_cells_are_stored_absent() {
        let settings = WriterSettings {
            fill_value: -1.0,
            ..Default::default()
        };
        let writer = writer(Arc::new(source()), settings);
        let chunk = plan().chunk(0).unwrap();
        let excluded = BTreeSet::from([vec![0, 1]]);

        let report = writer.write_excluding(&chunk, &excluded).await.unwrap();
        assert_eq!(report.live_cells, 3);
        assert_eq!(report.degraded, vec![vec![0, 1]]);
        assert_eq!(report.stats.count, 9);

        let assembled = writer.assemble(&chunk, &excluded).await.unwrap();
        assert_eq!(assembled.liveness, vec![true, false, true, true]);
        let values = SampleBuffer::from_bytes(DataType::F32, assembled.data)
            .unwrap()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(&values[3..6], &[-1.0, -1.0, -1.0]);
    }
}
