//! Error types for ingestion operations

use thiserror::Error;

/// Main error type for ingestion operations
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record at offset {offset}: {reason}")]
    MalformedRecord { offset: u64, reason: String },

    #[error(
        "Duplicate coordinate {keys:?}: records at offsets {first_offset} and {second_offset} map to the same cell"
    )]
    DuplicateCoordinate {
        keys: Vec<i64>,
        first_offset: u64,
        second_offset: u64,
    },

    #[error("Failed to read samples at offset {offset}: {reason}")]
    RecordRead { offset: u64, reason: String },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Store write failed for '{key}': {reason}")]
    StoreWrite {
        key: String,
        reason: String,
        transient: bool,
    },

    #[error("Chunk {coord:?} failed after {attempts} attempt(s): {source}")]
    ChunkFailed {
        coord: Vec<usize>,
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Grid override error: {0}")]
    GridOverride(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid axis '{axis}': {reason}")]
    InvalidAxis { axis: String, reason: String },

    #[error("Checksum mismatch for '{key}': expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        key: String,
        expected: u32,
        actual: u32,
    },

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Ingestion cancelled")]
    Cancelled,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IngestError {
    /// Whether the coordinator may retry the failed operation
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::StoreWrite { transient, .. } => *transient,
            IngestError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Specialized Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

impl From<bincode::Error> for IngestError {
    fn from(err: bincode::Error) -> Self {
        IngestError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = IngestError::StoreWrite {
            key: "seismic/c/0/0/0".into(),
            reason: "throttled".into(),
            transient: true,
        };
        assert!(transient.is_transient());
        assert!(IngestError::Timeout("chunk [0, 0]".into()).is_transient());
        assert!(!IngestError::Compression("bad".into()).is_transient());
        assert!(!IngestError::RecordRead {
            offset: 3,
            reason: "eof".into()
        }
        .is_transient());
    }

    #[test]
    fn test_duplicate_message_names_both_offsets() {
        let err = IngestError::DuplicateCoordinate {
            keys: vec![100, 10],
            first_offset: 240,
            second_offset: 3840,
        };
        let msg = err.to_string();
        assert!(msg.contains("240"));
        assert!(msg.contains("3840"));
    }
}
