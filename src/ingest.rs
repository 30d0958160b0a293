//! End-to-end ingestion: index, resolve, plan, write, finalize

use crate::config::IngestConfig;
use crate::coordinator::{Coordinator, IngestOutcome, IngestReport};
use crate::error::{IngestError, Result};
use crate::grid::{Collision, ResolvedGrid};
use crate::header_index::HeaderIndex;
use crate::layout::{default_chunking, ChunkPlan};
use crate::metadata::{ArrayDescriptor, MetadataFinalizer, StoreDescriptor};
use crate::overrides::apply_overrides;
use crate::record::RecordSource;
use crate::store::ArrayStore;
use crate::writer::ChunkWriter;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a completed ingestion
#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub descriptor: StoreDescriptor,
    pub report: IngestReport,
    /// Collisions resolved by a keep-first or keep-last policy
    pub collisions: Vec<Collision>,
}

/// Runs the whole pipeline against one store
pub struct Ingestor {
    config: IngestConfig,
    store: ArrayStore,
    cancel: CancellationToken,
}

impl Ingestor {
    /// Validate the configuration and open its output store
    pub async fn new(config: IngestConfig) -> Result<Self> {
        config.validate()?;
        let store = ArrayStore::open(&config.output_url).await?;
        Ok(Self::with_store(config, store))
    }

    /// Ingest into an already opened store, e.g. one over a custom [`crate::IOManager`]
    pub fn with_store(config: IngestConfig, store: ArrayStore) -> Self {
        Self {
            config,
            store,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn store(&self) -> &ArrayStore {
        &self.store
    }

    /// Ingest every record of `source`.
    ///
    /// The descriptor is written only after every chunk is stored; on failure
    /// the store has no descriptor and the error of the failing stage is returned.
    pub async fn run(&self, source: Arc<dyn RecordSource>) -> Result<IngestSummary> {
        self.config.validate()?;
        let started = Instant::now();

        if self.store.delete_descriptor().await? {
            info!("removed descriptor left by an earlier run");
        }

        let mut index = self.header_index(source.as_ref()).await?;
        if let Some(expected) = self.config.data_type {
            if expected != index.data_type() {
                return Err(IngestError::Configuration(format!(
                    "source holds {} samples, configured for {}",
                    index.data_type(),
                    expected
                )));
            }
        }

        let (mut chunk_shape, sample_chunk) = match &self.config.chunk_shape {
            Some(shape) => (shape.clone(), self.config.sample_chunk),
            None => {
                let (shape, samples) = default_chunking(self.config.axis_keys.len())?;
                (shape, Some(self.config.sample_chunk.unwrap_or(samples)))
            }
        };
        apply_overrides(&mut index, &self.config.grid_overrides, Some(&mut chunk_shape))?;

        let grid = Arc::new(self.config.resolver().resolve(&index)?);
        drop(index);

        let plan = ChunkPlan::new(grid.shape(), &chunk_shape)?
            .with_samples(grid.sample_count, sample_chunk)?;
        let writer = ChunkWriter::new(
            source,
            self.store.clone(),
            grid.clone(),
            self.config.writer_settings(),
        )?;

        let coordinator = Coordinator::new(self.config.coordinator_config())
            .with_cancellation(self.cancel.clone());
        let outcome = coordinator.run(&plan, &writer).await?;

        let descriptor = match self.finalizer(&grid).finalize(&outcome, &grid, &plan).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                return Err(match outcome {
                    IngestOutcome::Aborted(cause) => cause,
                    IngestOutcome::Completed(_) => err,
                })
            }
        };
        let report = outcome.into_result()?;

        info!(
            store = %descriptor.summary(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion complete"
        );
        Ok(IngestSummary {
            descriptor,
            report,
            collisions: grid.collisions.clone(),
        })
    }

    async fn header_index(&self, source: &dyn RecordSource) -> Result<HeaderIndex> {
        let io = self.store.io().as_ref();
        let fingerprint = match (self.config.header_checkpoint, source.fingerprint()) {
            (true, Some(fingerprint)) => Some(fingerprint),
            (true, None) => {
                warn!("record source has no fingerprint, header index checkpoint disabled");
                None
            }
            (false, _) => None,
        };

        if let Some(fingerprint) = &fingerprint {
            match HeaderIndex::load(io, fingerprint).await {
                Ok(Some(index)) if index.axis_names() == self.config.axis_keys.as_slice() => {
                    info!(records = index.len(), "reusing header index checkpoint");
                    return Ok(index);
                }
                Ok(Some(_)) => warn!("header index checkpoint has different axes, rebuilding"),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "header index checkpoint unreadable, rebuilding"),
            }
        }

        let index = HeaderIndex::build(source.decode(), &self.config.axis_keys).await?;
        if let Some(fingerprint) = &fingerprint {
            index.save(io, fingerprint).await?;
        }
        Ok(index)
    }

    fn finalizer(&self, grid: &ResolvedGrid) -> MetadataFinalizer {
        let array = ArrayDescriptor {
            data_type: grid.data_type,
            codec_id: self.config.codec.method.id().to_string(),
            codec: self.config.codec,
            fill_value: self.config.fill_value,
        };
        let mut finalizer = MetadataFinalizer::new(self.store.clone(), self.config.array_name.clone(), array)
            .with_sample_axis(self.config.sample_axis.clone());
        for (key, value) in &self.config.custom_attributes {
            finalizer.add_metadata(key.clone(), value.clone());
        }
        finalizer
    }
}
