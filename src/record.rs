//! Source records and the record source contract

use crate::error::{IngestError, Result};
use crate::types::SampleBuffer;
use async_trait::async_trait;
use crc32fast::Hasher;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};

/// One decoded trace: header keys, sample payload and its source offset
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Header key values by field name
    pub keys: BTreeMap<String, i64>,
    /// Sample payload
    pub samples: SampleBuffer,
    /// Position in the source, usable with [`RecordSource::read_samples`]
    pub offset: u64,
}

impl Record {
    pub fn new<K, I>(offset: u64, keys: I, samples: SampleBuffer) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, i64)>,
    {
        Self {
            keys: keys.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            samples,
            offset,
        }
    }

    /// Header key value, or `MalformedRecord` if the field is missing
    pub fn key(&self, name: &str) -> Result<i64> {
        self.keys
            .get(name)
            .copied()
            .ok_or_else(|| IngestError::MalformedRecord {
                offset: self.offset,
                reason: format!("missing header key '{}'", name),
            })
    }
}

/// Decoder for a header-addressed trace source.
///
/// `decode` yields a lazy, forward-only, finite sequence; it is called once per
/// ingestion and need not be restartable. `read_samples` must support repeated,
/// out-of-order reads by offset.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Stream every record in source order
    fn decode(&self) -> BoxStream<'_, Result<Record>>;

    /// Re-read the sample payload of the record at `offset`
    async fn read_samples(&self, offset: u64) -> Result<SampleBuffer>;

    /// Identity of the source contents, e.g. path, size and modification time.
    ///
    /// A header index checkpoint is only reused for a source with the same
    /// fingerprint; sources without one are always scanned.
    fn fingerprint(&self) -> Option<String> {
        None
    }
}

/// Record source over records held in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordSource {
    records: Vec<Record>,
    by_offset: HashMap<u64, usize>,
}

impl MemoryRecordSource {
    pub fn new(records: Vec<Record>) -> Self {
        let by_offset = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.offset, i))
            .collect();
        Self { records, by_offset }
    }

    pub fn push(&mut self, record: Record) {
        self.by_offset.insert(record.offset, self.records.len());
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    fn decode(&self) -> BoxStream<'_, Result<Record>> {
        stream::iter(self.records.iter().cloned().map(Ok)).boxed()
    }

    async fn read_samples(&self, offset: u64) -> Result<SampleBuffer> {
        self.by_offset
            .get(&offset)
            .map(|&i| self.records[i].samples.clone())
            .ok_or_else(|| IngestError::RecordRead {
                offset,
                reason: "no record at offset".to_string(),
            })
    }

    /// Record count plus a CRC32 over every offset, header key and sample shape
    fn fingerprint(&self) -> Option<String> {
        let mut hasher = Hasher::new();
        for record in &self.records {
            hasher.update(&record.offset.to_le_bytes());
            for (name, value) in &record.keys {
                hasher.update(name.as_bytes());
                hasher.update(&value.to_le_bytes());
            }
            hasher.update(&[record.samples.data_type() as u8]);
            hasher.update(&(record.samples.len() as u64).to_le_bytes());
        }
        Some(format!("memory:{}:{:08x}", self.records.len(), hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn trace(offset: u64, il: i64, xl: i64) -> Record {
        Record::new(
            offset,
            [("inline", il), ("crossline", xl)],
            SampleBuffer::from_samples(&[il as f32, xl as f32]),
        )
    }

    #[tokio::test]
    async fn test_memory_source_random_access() {
        let source = MemoryRecordSource::new(vec![trace(0, 1, 1), trace(240, 1, 2)]);
        let decoded: Vec<Record> = source.decode().try_collect().await.unwrap();
        assert_eq!(decoded.len(), 2);

        // Out of order and repeated reads
        let second = source.read_samples(240).await.unwrap();
        assert_eq!(second.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        let first = source.read_samples(0).await.unwrap();
        assert_eq!(first.to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
        assert!(source.read_samples(240).await.is_ok());

        assert!(matches!(
            source.read_samples(7).await,
            Err(IngestError::RecordRead { offset: 7, .. })
        ));
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let a = MemoryRecordSource::new(vec![trace(0, 1, 1), trace(240, 1, 2)]);
        let same = MemoryRecordSource::new(vec![trace(0, 1, 1), trace(240, 1, 2)]);
        let moved = MemoryRecordSource::new(vec![trace(0, 1, 1), trace(240, 2, 2)]);
        let shorter = MemoryRecordSource::new(vec![trace(0, 1, 1)]);

        assert!(a.fingerprint().unwrap().starts_with("memory:2:"));
        assert_eq!(a.fingerprint(), same.fingerprint());
        assert_ne!(a.fingerprint(), moved.fingerprint());
        assert_ne!(a.fingerprint(), shorter.fingerprint());
    }

    #[test]
    fn test_missing_key_is_malformed() {
        let record = trace(480, 3, 4);
        assert_eq!(record.key("inline").unwrap(), 3);
        assert!(matches!(
            record.key("cdp"),
            Err(IngestError::MalformedRecord { offset: 480, .. })
        ));
    }
}
