//! Header index - per-record coordinate keys and offsets for a whole input
//!
//! Building the index streams every record once and keeps only the header key
//! tuple and source offset of each; sample payloads are dropped as soon as
//! their length and type have been checked.

use crate::error::{IngestError, Result};
use crate::io::IOManager;
use crate::record::Record;
use crate::types::DataType;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info};

/// Store key used for index checkpoints
pub const HEADER_INDEX_KEY: &str = "header_index.bin";

/// Columnar index of header key tuples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderIndex {
    axis_names: Vec<String>,
    /// One column per axis, one row per record
    columns: Vec<Vec<i64>>,
    offsets: Vec<u64>,
    distinct: Vec<BTreeSet<i64>>,
    sample_count: usize,
    data_type: DataType,
}

impl HeaderIndex {
    /// Consume a record stream and index the given header keys, in axis order
    pub async fn build(
        mut records: BoxStream<'_, Result<Record>>,
        axis_keys: &[String],
    ) -> Result<Self> {
        validate_axis_names(axis_keys)?;

        let started = Instant::now();
        let rank = axis_keys.len();
        let mut columns: Vec<Vec<i64>> = vec![Vec::new(); rank];
        let mut distinct: Vec<BTreeSet<i64>> = vec![BTreeSet::new(); rank];
        let mut offsets = Vec::new();
        let mut shape: Option<(usize, DataType)> = None;

        while let Some(record) = records.next().await {
            let record = record?;

            let (count, data_type) = *shape.get_or_insert((record.samples.len(), record.samples.data_type()));
            if record.samples.len() != count || record.samples.data_type() != data_type {
                return Err(IngestError::MalformedRecord {
                    offset: record.offset,
                    reason: format!(
                        "expected {} {} samples, found {} {}",
                        count,
                        data_type,
                        record.samples.len(),
                        record.samples.data_type()
                    ),
                });
            }

            for (axis, name) in axis_keys.iter().enumerate() {
                let value = record.key(name)?;
                columns[axis].push(value);
                distinct[axis].insert(value);
            }
            offsets.push(record.offset);

            if offsets.len() % 1_000_000 == 0 {
                debug!(records = offsets.len(), "indexing headers");
            }
        }

        let (sample_count, data_type) = shape.ok_or_else(|| {
            IngestError::InvalidDimensions("record source produced no records".to_string())
        })?;

        info!(
            records = offsets.len(),
            axes = ?axis_keys,
            distinct = ?distinct.iter().map(|d| d.len()).collect::<Vec<_>>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "header index built"
        );

        Ok(Self {
            axis_names: axis_keys.to_vec(),
            columns,
            offsets,
            distinct,
            sample_count,
            data_type,
        })
    }

    /// Build an index directly from columns (used by checkpoints and tests)
    pub fn from_columns(
        axis_names: Vec<String>,
        columns: Vec<Vec<i64>>,
        offsets: Vec<u64>,
        sample_count: usize,
        data_type: DataType,
    ) -> Result<Self> {
        validate_axis_names(&axis_names)?;
        if columns.len() != axis_names.len() {
            return Err(IngestError::InvalidDimensions(format!(
                "{} columns for {} axes",
                columns.len(),
                axis_names.len()
            )));
        }
        if columns.iter().any(|c| c.len() != offsets.len()) {
            return Err(IngestError::InvalidDimensions(
                "every column must have one value per record".to_string(),
            ));
        }
        let distinct = columns
            .iter()
            .map(|c| c.iter().copied().collect())
            .collect();
        Ok(Self {
            axis_names,
            columns,
            offsets,
            distinct,
            sample_count,
            data_type,
        })
    }

    pub fn axis_names(&self) -> &[String] {
        &self.axis_names
    }

    pub fn rank(&self) -> usize {
        self.axis_names.len()
    }

    /// Number of indexed records
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Samples per record
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Position of a named axis
    pub fn axis_position(&self, name: &str) -> Option<usize> {
        self.axis_names.iter().position(|n| n == name)
    }

    /// Key values of one axis for every record
    pub fn column(&self, axis: usize) -> &[i64] {
        &self.columns[axis]
    }

    /// Distinct key values observed on one axis, ascending
    pub fn distinct(&self, axis: usize) -> &BTreeSet<i64> {
        &self.distinct[axis]
    }

    /// Key tuple of record `row`
    pub fn keys(&self, row: usize) -> Vec<i64> {
        self.columns.iter().map(|c| c[row]).collect()
    }

    /// Replace the key values of one axis
    pub fn set_column(&mut self, axis: usize, values: Vec<i64>) -> Result<()> {
        if values.len() != self.offsets.len() {
            return Err(IngestError::InvalidDimensions(format!(
                "column has {} values for {} records",
                values.len(),
                self.offsets.len()
            )));
        }
        self.distinct[axis] = values.iter().copied().collect();
        self.columns[axis] = values;
        Ok(())
    }

    /// Append a new trailing axis
    pub fn push_axis(&mut self, name: impl Into<String>, values: Vec<i64>) -> Result<()> {
        let name = name.into();
        if self.axis_position(&name).is_some() {
            return Err(IngestError::InvalidAxis {
                axis: name,
                reason: "axis already exists".to_string(),
            });
        }
        if values.len() != self.offsets.len() {
            return Err(IngestError::InvalidDimensions(format!(
                "column has {} values for {} records",
                values.len(),
                self.offsets.len()
            )));
        }
        self.axis_names.push(name);
        self.distinct.push(values.iter().copied().collect());
        self.columns.push(values);
        Ok(())
    }

    /// Persist the index so a restarted ingestion can skip the header scan.
    ///
    /// `fingerprint` identifies the source the index was built from; see
    /// [`crate::RecordSource::fingerprint`].
    pub async fn save(&self, io: &dyn IOManager, fingerprint: &str) -> Result<()> {
        let encoded = bincode::serialize(&CheckpointRef {
            fingerprint,
            index: self,
        })?;
        io.write(HEADER_INDEX_KEY, &encoded).await?;
        debug!(bytes = encoded.len(), "header index checkpoint written");
        Ok(())
    }

    /// Load a checkpoint written by [`HeaderIndex::save`] for the source with
    /// this `fingerprint`; `None` if there is none or it belongs to another source
    pub async fn load(io: &dyn IOManager, fingerprint: &str) -> Result<Option<Self>> {
        if !io.exists(HEADER_INDEX_KEY).await? {
            return Ok(None);
        }
        let bytes = io.read(HEADER_INDEX_KEY).await?;
        let checkpoint: Checkpoint = bincode::deserialize(&bytes)?;
        if checkpoint.fingerprint != fingerprint {
            info!(
                stored = %checkpoint.fingerprint,
                source = %fingerprint,
                "header index checkpoint belongs to another source"
            );
            return Ok(None);
        }
        Ok(Some(checkpoint.index))
    }
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    fingerprint: &'a str,
    index: &'a HeaderIndex,
}

#[derive(Deserialize)]
struct Checkpoint {
    fingerprint: String,
    index: HeaderIndex,
}

fn validate_axis_names(names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(IngestError::InvalidDimensions(
            "at least one axis key is required".to_string(),
        ));
    }
    let unique: BTreeSet<&String> = names.iter().collect();
    if unique.len() != names.len() {
        return Err(IngestError::InvalidDimensions(format!(
            "axis keys must be unique: {:?}",
            names
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIOManager;
    use crate::record::{MemoryRecordSource, RecordSource};
    use crate::types::SampleBuffer;

    fn trace(offset: u64, il: i64, xl: i64) -> Record {
        Record::new(
            offset,
            [("inline", il), ("crossline", xl), ("cdp_x", il * 25)],
            SampleBuffer::from_samples(&[0.0f32; 4]),
        )
    }

    fn axes() -> Vec<String> {
        vec!["inline".to_string(), "crossline".to_string()]
    }

    #[tokio::test]
    async fn test_build_collects_distinct_values() {
        let source = MemoryRecordSource::new(vec![
            trace(0, 102, 10),
            trace(1, 100, 11),
            trace(2, 101, 10),
            trace(3, 100, 10),
        ]);
        let index = HeaderIndex::build(source.decode(), &axes()).await.unwrap();

        assert_eq!(index.len(), 4);
        assert_eq!(index.sample_count(), 4);
        assert_eq!(index.data_type(), DataType::F32);
        assert_eq!(
            index.distinct(0).iter().copied().collect::<Vec<_>>(),
            vec![100, 101, 102]
        );
        assert_eq!(index.distinct(1).len(), 2);
        assert_eq!(index.keys(1), vec![100, 11]);
        assert_eq!(index.offsets(), &[0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_axis_key() {
        let broken = Record::new(
            96,
            [("inline", 1)],
            SampleBuffer::from_samples(&[0.0f32; 4]),
        );
        let source = MemoryRecordSource::new(vec![trace(0, 1, 1), broken]);
        let err = HeaderIndex::build(source.decode(), &axes()).await.unwrap_err();
        assert!(matches!(err, IngestError::MalformedRecord { offset: 96, .. }));
    }

    #[tokio::test]
    async fn test_inconsistent_sample_count() {
        let short = Record::new(
            7,
            [("inline", 2), ("crossline", 1)],
            SampleBuffer::from_samples(&[0.0f32; 3]),
        );
        let source = MemoryRecordSource::new(vec![trace(0, 1, 1), short]);
        let err = HeaderIndex::build(source.decode(), &axes()).await.unwrap_err();
        assert!(matches!(err, IngestError::MalformedRecord { offset: 7, .. }));
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_axes() {
        let source = MemoryRecordSource::default();
        assert!(HeaderIndex::build(source.decode(), &axes()).await.is_err());

        let source = MemoryRecordSource::new(vec![trace(0, 1, 1)]);
        let dup = vec!["inline".to_string(), "inline".to_string()];
        assert!(HeaderIndex::build(source.decode(), &dup).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let io = MemoryIOManager::new();
        assert!(HeaderIndex::load(&io, "a").await.unwrap().is_none());

        let source = MemoryRecordSource::new(vec![trace(0, 1, 1), trace(1, 1, 2)]);
        let index = HeaderIndex::build(source.decode(), &axes()).await.unwrap();
        index.save(&io, "a").await.unwrap();

        let loaded = HeaderIndex::load(&io, "a").await.unwrap().unwrap();
        assert_eq!(loaded, index);
        assert!(HeaderIndex::load(&io, "b").await.unwrap().is_none());
    }

    #[test]
    fn test_push_axis_and_set_column() {
        let mut index = HeaderIndex::from_columns(
            axes(),
            vec![vec![1, 1, 2], vec![5, 5, 6]],
            vec![0, 1, 2],
            10,
            DataType::I16,
        )
        .unwrap();
        index.push_axis("trace", vec![1, 2, 1]).unwrap();
        assert_eq!(index.rank(), 3);
        assert_eq!(index.keys(1), vec![1, 5, 2]);
        assert!(index.push_axis("trace", vec![0, 0, 0]).is_err());

        index.set_column(1, vec![7, 7, 7]).unwrap();
        assert_eq!(index.distinct(1).len(), 1);
        assert!(index.set_column(1, vec![1]).is_err());
    }
}
