//! Chunked array store over an [`IOManager`]
//!
//! Layout:
//! - `descriptor.json` - the store descriptor, written last
//! - `live_mask.bin` - global liveness mask
//! - `<array>/c/<i>/<j>/.../<sample block>` - one object per chunk
//!
//! A chunk object holds the compressed payload and the chunk's liveness bits
//! in one envelope, so a chunk becomes visible as a single atomic write.

use crate::error::{IngestError, Result};
use crate::grid::LivenessMask;
use crate::io::{create_io_manager, IOManager};
use crate::metadata::StoreDescriptor;
use crate::utils::{calculate_checksum, pack_bits, unpack_bits};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const DESCRIPTOR_KEY: &str = "descriptor.json";
pub const LIVE_MASK_KEY: &str = "live_mask.bin";

/// Magic prefix of every chunk object
pub const CHUNK_MAGIC: &[u8; 4] = b"VDC\0";
const ENVELOPE_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ChunkEnvelope {
    version: u16,
    checksum: u32,
    liveness: Vec<u8>,
    payload: Vec<u8>,
}

fn envelope_checksum(liveness: &[u8], payload: &[u8]) -> u32 {
    let mut data = Vec::with_capacity(liveness.len() + payload.len());
    data.extend_from_slice(liveness);
    data.extend_from_slice(payload);
    calculate_checksum(&data)
}

/// A chunk object as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    /// Compressed sample payload
    pub payload: Vec<u8>,
    /// Packed liveness bits of the chunk's cells
    pub liveness: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PackedMask {
    shape: Vec<usize>,
    bits: Vec<u8>,
}

/// Chunk and descriptor persistence for one ingestion target
#[derive(Clone)]
pub struct ArrayStore {
    io: Arc<dyn IOManager>,
}

impl ArrayStore {
    pub fn new(io: Arc<dyn IOManager>) -> Self {
        Self { io }
    }

    /// Open the store behind a URL (`file://`, `memory://` or a plain path)
    pub async fn open(url: &str) -> Result<Self> {
        let io: Arc<dyn IOManager> = Arc::from(create_io_manager(url).await?);
        Ok(Self::new(io))
    }

    pub fn io(&self) -> &Arc<dyn IOManager> {
        &self.io
    }

    /// Encode a chunk envelope exactly as it is stored
    pub fn encode_chunk(compressed: &[u8], liveness: &[u8]) -> Result<Vec<u8>> {
        let envelope = ChunkEnvelope {
            version: ENVELOPE_VERSION,
            checksum: envelope_checksum(liveness, compressed),
            liveness: liveness.to_vec(),
            payload: compressed.to_vec(),
        };
        let mut bytes = CHUNK_MAGIC.to_vec();
        bytes.extend(bincode::serialize(&envelope)?);
        Ok(bytes)
    }

    /// Persist one chunk; returns the stored object size
    pub async fn write_chunk(&self, key: &str, compressed: &[u8], liveness: &[u8]) -> Result<usize> {
        let bytes = Self::encode_chunk(compressed, liveness)?;
        self.io.write(key, &bytes).await?;
        debug!(key, bytes = bytes.len(), "chunk written");
        Ok(bytes.len())
    }

    /// Read and verify one chunk
    pub async fn read_chunk(&self, key: &str) -> Result<StoredChunk> {
        let bytes = self.io.read(key).await?;
        if bytes.len() < CHUNK_MAGIC.len() || &bytes[..CHUNK_MAGIC.len()] != CHUNK_MAGIC {
            return Err(IngestError::Metadata(format!("'{}' is not a chunk object", key)));
        }
        let envelope: ChunkEnvelope = bincode::deserialize(&bytes[CHUNK_MAGIC.len()..])?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(IngestError::Metadata(format!(
                "unsupported chunk envelope version {}",
                envelope.version
            )));
        }
        let actual = envelope_checksum(&envelope.liveness, &envelope.payload);
        if actual != envelope.checksum {
            return Err(IngestError::Checksum {
                key: key.to_string(),
                expected: envelope.checksum,
                actual,
            });
        }
        Ok(StoredChunk {
            payload: envelope.payload,
            liveness: envelope.liveness,
        })
    }

    pub async fn chunk_exists(&self, key: &str) -> Result<bool> {
        self.io.exists(key).await
    }

    /// Persist the descriptor; this marks the store complete
    pub async fn write_descriptor(&self, descriptor: &StoreDescriptor) -> Result<()> {
        let json = serde_json::to_vec_pretty(descriptor)?;
        self.io.write(DESCRIPTOR_KEY, &json).await
    }

    /// Read the descriptor; `NotFound` means the ingestion never completed
    pub async fn read_descriptor(&self) -> Result<StoreDescriptor> {
        let bytes = self.io.read(DESCRIPTOR_KEY).await?;
        serde_json::from_slice(&bytes).map_err(|e| IngestError::Metadata(e.to_string()))
    }

    pub async fn has_descriptor(&self) -> Result<bool> {
        self.io.exists(DESCRIPTOR_KEY).await
    }

    /// Remove a descriptor left by an earlier run; returns whether one existed
    pub async fn delete_descriptor(&self) -> Result<bool> {
        if self.io.exists(DESCRIPTOR_KEY).await? {
            self.io.delete(DESCRIPTOR_KEY).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn write_live_mask(&self, mask: &LivenessMask) -> Result<()> {
        let packed = PackedMask {
            shape: mask.shape().to_vec(),
            bits: pack_bits(mask.bits()),
        };
        self.io.write(LIVE_MASK_KEY, &bincode::serialize(&packed)?).await
    }

    pub async fn read_live_mask(&self) -> Result<LivenessMask> {
        let bytes = self.io.read(LIVE_MASK_KEY).await?;
        let packed: PackedMask = bincode::deserialize(&bytes)?;
        let len = packed.shape.iter().product();
        let bits = unpack_bits(&packed.bits, len)
            .ok_or_else(|| IngestError::Metadata("live mask size mismatch".to_string()))?;
        LivenessMask::new(packed.shape, bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIOManager;

    fn store() -> ArrayStore {
        ArrayStore::new(Arc::new(MemoryIOManager::new()))
    }

    #[tokio::test]
    async fn test_chunk_roundtrip_and_overwrite() {
        let store = store();
        let size = store
            .write_chunk("seismic/c/0/0/0", b"payload", &[0b101])
            .await
            .unwrap();
        assert!(size > 8);
        assert!(store.chunk_exists("seismic/c/0/0/0").await.unwrap());

        let chunk = store.read_chunk("seismic/c/0/0/0").await.unwrap();
        assert_eq!(chunk.payload, b"payload");
        assert_eq!(chunk.liveness, vec![0b101]);

        store
            .write_chunk("seismic/c/0/0/0", b"second", &[0b1])
            .await
            .unwrap();
        let chunk = store.read_chunk("seismic/c/0/0/0").await.unwrap();
        assert_eq!(chunk.payload, b"second");
    }

    #[tokio::test]
    async fn test_corrupted_chunk_is_detected() {
        let store = store();
        let mut bytes = ArrayStore::encode_chunk(b"abcdef", &[1]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        store.io().write("seismic/c/0/0", &bytes).await.unwrap();
        assert!(matches!(
            store.read_chunk("seismic/c/0/0").await,
            Err(IngestError::Checksum { .. })
        ));

        store.io().write("seismic/c/0/1", b"junk").await.unwrap();
        assert!(store.read_chunk("seismic/c/0/1").await.is_err());
    }

    #[tokio::test]
    async fn test_encoding_is_deterministic() {
        let a = ArrayStore::encode_chunk(b"xyz", &[3]).unwrap();
        let b = ArrayStore::encode_chunk(b"xyz", &[3]).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..4], CHUNK_MAGIC);
    }

    #[tokio::test]
    async fn test_live_mask_roundtrip() {
        let store = store();
        let mask = LivenessMask::new(vec![3, 2], vec![true, true, false, true, true, false]).unwrap();
        store.write_live_mask(&mask).await.unwrap();
        assert_eq!(store.read_live_mask().await.unwrap(), mask);
    }

    #[tokio::test]
    async fn test_missing_descriptor() {
        let store = store();
        assert!(!store.has_descriptor().await.unwrap());
        assert!(matches!(
            store.read_descriptor().await,
            Err(IngestError::NotFound(_))
        ));
        assert!(!store.delete_descriptor().await.unwrap());
    }
}
