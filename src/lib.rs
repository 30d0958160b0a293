//! vds-ingest - seismic trace ingestion into chunked array stores
//!
//! Turns a stream of header-addressed traces into a dense, chunked,
//! compressed N-dimensional array with a liveness mask and a self-describing
//! descriptor.
//!
//! # Pipeline
//!
//! - [`HeaderIndex`] - one pass over the record headers
//! - [`GridResolver`] - dense grid, coordinate map and liveness mask
//! - [`ChunkPlan`] - fixed-shape partition of the grid
//! - [`ChunkWriter`] - assembles, compresses and stores one chunk
//! - [`Coordinator`] - bounded concurrency, retries and cancellation
//! - [`MetadataFinalizer`] - global liveness, statistics and the descriptor
//!
//! A store without `descriptor.json` is incomplete; [`VolumeReader::open`]
//! refuses it.
//!
//! # Cloud Storage
//!
//! Filesystem and memory stores are built in. For cloud storage (S3, Azure, GCS),
//! implement the `IOManager` trait in your application and pass the store to
//! [`Ingestor::with_store`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vds_ingest::{IngestConfig, Ingestor, VolumeReader};
//!
//! # async fn example(source: Arc<dyn vds_ingest::RecordSource>) -> vds_ingest::Result<()> {
//! let config = IngestConfig::new("file:///data/survey").with_axes(["inline", "crossline"]);
//! let summary = Ingestor::new(config).await?.run(source).await?;
//! println!("{}", summary.descriptor.summary());
//!
//! let reader = VolumeReader::open_url("file:///data/survey").await?;
//! let trace = reader.read_trace(&[10, 20]).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod compression;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod grid;
pub mod header_index;
pub mod ingest;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod overrides;
pub mod record;
pub mod stats;
pub mod store;
pub mod types;
pub mod utils;
pub mod writer;

// Re-exports
pub use access::{ChunkData, VolumeReader};
pub use compression::{CodecSpec, CompressionLevel, CompressionMethod, Compressor};
pub use config::IngestConfig;
pub use coordinator::{ChunkState, Coordinator, CoordinatorConfig, IngestOutcome, IngestReport};
pub use error::{IngestError, Result};
pub use grid::{AxisOrdering, CollisionPolicy, GridResolver, LivenessMask, ResolvedGrid};
pub use header_index::HeaderIndex;
pub use ingest::{IngestSummary, Ingestor};
pub use io::{IOManager, StorageBackend};
pub use layout::{ChunkPlan, PlannedChunk};
pub use metadata::{MetadataFinalizer, StoreDescriptor};
pub use overrides::GridOverride;
pub use record::{MemoryRecordSource, Record, RecordSource};
pub use stats::{SampleStats, StatsSummary};
pub use store::ArrayStore;
pub use types::{Axis, DataType, SampleAxis, SampleBuffer};
pub use writer::{ChunkReport, ChunkWriter, WriterSettings};

/// Version of the crate, recorded in every descriptor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
