//! Execution coordinator - runs every planned chunk through the writer
//!
//! Chunks run concurrently up to `max_in_flight`. Transient failures
//! (throttled store writes, timeouts) are retried with exponential backoff;
//! any other failure aborts the run. Per-chunk statistics are reduced in plan
//! order once every chunk has succeeded, so the result does not depend on the
//! order in which chunks complete.

use crate::error::{IngestError, Result};
use crate::layout::{ChunkPlan, PlannedChunk};
use crate::stats::SampleStats;
use crate::utils::format_bytes;
use crate::writer::{ChunkReport, ChunkWriter};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coordinator tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Chunks assembled or written at the same time
    pub max_in_flight: usize,
    /// Retries per chunk after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further attempt
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    /// Limit for one write attempt
    pub chunk_timeout: Option<Duration>,
    /// Skip chunks already present in the store
    pub resume: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            chunk_timeout: None,
            resume: false,
        }
    }
}

/// Lifecycle of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Planned,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

/// Snapshot of chunk states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub planned: usize,
    pub in_flight: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.succeeded == self.total
    }
}

/// Aggregate of every chunk of a completed run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub chunks_written: usize,
    pub chunks_recovered: usize,
    /// Grid cells covered by the chunks of the first sample block
    pub cells_covered: usize,
    /// Grid cells stored as live in every sample block
    pub live_cells: usize,
    /// Grid cells dropped for unreadable samples, sorted
    pub degraded: Vec<Vec<usize>>,
    pub raw_bytes: usize,
    pub stored_bytes: usize,
    pub retries: u32,
    pub stats: SampleStats,
    pub elapsed: Duration,
}

impl IngestReport {
    /// Reduce chunk reports in plan order
    pub fn from_chunks(chunks: impl IntoIterator<Item = ChunkReport>) -> Self {
        let mut report = IngestReport::default();
        let mut live_in_first_block = 0;
        for chunk in chunks {
            if chunk.recovered {
                report.chunks_recovered += 1;
            } else {
                report.chunks_written += 1;
            }
            if chunk.sample_block == 0 {
                report.cells_covered += chunk.total_cells;
                live_in_first_block += chunk.live_cells + chunk.degraded.len();
            }
            report.raw_bytes += chunk.raw_bytes;
            report.stored_bytes += chunk.stored_bytes;
            report.stats = report.stats.merge(chunk.stats);
            report.degraded.extend(chunk.degraded);
        }
        report.degraded.sort();
        report.degraded.dedup();
        report.live_cells = live_in_first_block.saturating_sub(report.degraded.len());
        report
    }

    pub fn compression_ratio(&self) -> f64 {
        if self.stored_bytes == 0 {
            0.0
        } else {
            self.raw_bytes as f64 / self.stored_bytes as f64
        }
    }
}

/// Terminal state of a run
#[derive(Debug)]
pub enum IngestOutcome {
    /// Every chunk succeeded
    Completed(IngestReport),
    /// A chunk failed or the run was cancelled
    Aborted(IngestError),
}

impl IngestOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, IngestOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<IngestReport> {
        match self {
            IngestOutcome::Completed(report) => Ok(report),
            IngestOutcome::Aborted(err) => Err(err),
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    states: Mutex<Vec<ChunkState>>,
    retries: AtomicU32,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            states: Mutex::new(Vec::new()),
            retries: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort the run when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Current state of the chunk at a plan index
    pub fn state(&self, index: usize) -> Option<ChunkState> {
        self.states.lock().get(index).copied()
    }

    pub fn progress(&self) -> Progress {
        let states = self.states.lock();
        let mut progress = Progress {
            total: states.len(),
            ..Default::default()
        };
        for state in states.iter() {
            match state {
                ChunkState::Planned => progress.planned += 1,
                ChunkState::InFlight => progress.in_flight += 1,
                ChunkState::Retrying => progress.retrying += 1,
                ChunkState::Succeeded => progress.succeeded += 1,
                ChunkState::Failed => progress.failed += 1,
            }
        }
        progress
    }

    /// Upper bound on uncompressed chunk memory held at once
    pub fn memory_bound(&self, plan: &ChunkPlan, writer: &ChunkWriter) -> usize {
        self.config.max_in_flight * plan.chunk_bytes(writer.data_type())
    }

    /// Write every chunk of `plan`.
    ///
    /// Returns `Err` only for an unusable configuration; chunk failures and
    /// cancellation produce [`IngestOutcome::Aborted`].
    pub async fn run(&self, plan: &ChunkPlan, writer: &ChunkWriter) -> Result<IngestOutcome> {
        if self.config.max_in_flight == 0 {
            return Err(IngestError::Configuration(
                "max_in_flight must be positive".to_string(),
            ));
        }

        let started = Instant::now();
        let total = plan.total_chunks();
        *self.states.lock() = vec![ChunkState::Planned; total];
        self.retries.store(0, Ordering::Relaxed);

        info!(
            plan = %plan.summary(),
            max_in_flight = self.config.max_in_flight,
            memory_bound = %format_bytes(self.memory_bound(plan, writer)),
            resume = self.config.resume,
            "writing chunks"
        );

        let none = BTreeSet::new();
        let mut results = stream::iter(plan.iter())
            .map(|chunk| self.process(chunk, writer, &none))
            .buffer_unordered(self.config.max_in_flight);

        let mut slots: Vec<Option<ChunkReport>> = vec![None; total];
        while let Some(result) = results.next().await {
            match result {
                Ok(report) => {
                    let index = report.index;
                    slots[index] = Some(report);
                }
                Err(err) => {
                    error!(error = %err, "ingestion aborted");
                    return Ok(IngestOutcome::Aborted(err));
                }
            }
        }
        drop(results);

        let mut reports: Vec<ChunkReport> = slots.into_iter().flatten().collect();
        if let Err(err) = self.reconcile_degraded(plan, writer, &mut reports).await {
            error!(error = %err, "ingestion aborted");
            return Ok(IngestOutcome::Aborted(err));
        }

        let mut report = IngestReport::from_chunks(reports);
        report.retries = self.retries.load(Ordering::Relaxed);
        report.elapsed = started.elapsed();
        info!(
            written = report.chunks_written,
            recovered = report.chunks_recovered,
            retries = report.retries,
            stored = %format_bytes(report.stored_bytes),
            ratio = %format!("{:.2}", report.compression_ratio()),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "all chunks stored"
        );
        Ok(IngestOutcome::Completed(report))
    }

    /// Rewrite chunks until a cell dropped in one sample block is absent in
    /// every sample block.
    ///
    /// Rewriting can drop further cells, so this repeats until no chunk holds
    /// a degraded cell as live.
    async fn reconcile_degraded(
        &self,
        plan: &ChunkPlan,
        writer: &ChunkWriter,
        reports: &mut [ChunkReport],
    ) -> Result<()> {
        loop {
            let degraded: BTreeSet<Vec<usize>> = reports
                .iter()
                .flat_map(|r| r.degraded.iter().cloned())
                .collect();
            if degraded.is_empty() {
                return Ok(());
            }

            let stale: Vec<PlannedChunk> = plan
                .iter()
                .filter(|chunk| {
                    let held = &reports[chunk.index].degraded;
                    degraded
                        .iter()
                        .any(|coord| chunk.contains(coord) && !held.contains(coord))
                })
                .collect();
            if stale.is_empty() {
                return Ok(());
            }

            info!(
                degraded = degraded.len(),
                chunks = stale.len(),
                "rewriting chunks that hold degraded cells"
            );
            let mut results = stream::iter(stale)
                .map(|chunk| self.process(chunk, writer, &degraded))
                .buffer_unordered(self.config.max_in_flight);
            while let Some(result) = results.next().await {
                let report = result?;
                let index = report.index;
                reports[index] = report;
            }
        }
    }

    async fn process(
        &self,
        chunk: PlannedChunk,
        writer: &ChunkWriter,
        excluded: &BTreeSet<Vec<usize>>,
    ) -> Result<ChunkReport> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.set_state(chunk.index, ChunkState::Failed);
                Err(IngestError::Cancelled)
            }
            result = self.process_chunk(&chunk, writer, excluded) => result,
        }
    }

    async fn process_chunk(
        &self,
        chunk: &PlannedChunk,
        writer: &ChunkWriter,
        excluded: &BTreeSet<Vec<usize>>,
    ) -> Result<ChunkReport> {
        if self.config.resume && excluded.is_empty() {
            if let Some(report) = self.try_recover(chunk, writer).await {
                self.set_state(chunk.index, ChunkState::Succeeded);
                return Ok(report);
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.set_state(chunk.index, ChunkState::InFlight);

            match self.attempt(chunk, writer, excluded).await {
                Ok(report) => {
                    self.set_state(chunk.index, ChunkState::Succeeded);
                    return Ok(report);
                }
                Err(err) if err.is_transient() && attempt <= self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    self.set_state(chunk.index, ChunkState::Retrying);
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        coord = ?chunk.coord,
                        sample_block = chunk.sample_block,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient chunk failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.set_state(chunk.index, ChunkState::Failed);
                    return Err(IngestError::ChunkFailed {
                        coord: chunk.coord.clone(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        chunk: &PlannedChunk,
        writer: &ChunkWriter,
        excluded: &BTreeSet<Vec<usize>>,
    ) -> Result<ChunkReport> {
        match self.config.chunk_timeout {
            Some(limit) => tokio::time::timeout(limit, writer.write_excluding(chunk, excluded))
                .await
                .unwrap_or_else(|_| {
                    Err(IngestError::Timeout(format!(
                        "chunk {:?} exceeded {:?}",
                        chunk.coord, limit
                    )))
                }),
            None => writer.write_excluding(chunk, excluded).await,
        }
    }

    async fn try_recover(&self, chunk: &PlannedChunk, writer: &ChunkWriter) -> Option<ChunkReport> {
        let key = writer.chunk_key(chunk);
        match writer.store().chunk_exists(&key).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "could not check for stored chunk");
                return None;
            }
        }
        match writer.recover(chunk).await {
            Ok(report) => {
                debug!(key = %key, "chunk already stored, skipping");
                Some(report)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "stored chunk unreadable, rewriting");
                None
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.config
            .retry_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    fn set_state(&self, index: usize, state: ChunkState) {
        if let Some(slot) = self.states.lock().get_mut(index) {
            *slot = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridResolver;
    use crate::header_index::HeaderIndex;
    use crate::io::{IOManager, MemoryIOManager, StorageBackend};
    use crate::record::{MemoryRecordSource, Record};
    use crate::store::ArrayStore;
    use crate::types::{DataType, SampleBuffer};
    use crate::writer::WriterSettings;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;

    /// Fails the first `failures` writes of every chunk key with a transient error
    struct FlakyIO {
        inner: MemoryIOManager,
        failures: u32,
        transient: bool,
        attempts: Mutex<std::collections::HashMap<String, u32>>,
    }

    impl FlakyIO {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                inner: MemoryIOManager::new(),
                failures,
                transient,
                attempts: Mutex::new(Default::default()),
            }
        }
    }

    #[async_trait]
    impl IOManager for FlakyIO {
        async fn read(&self, path: &str) -> Result<Bytes> {
            self.inner.read(path).await
        }

        async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                let n = attempts.entry(path.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            if attempt <= self.failures {
                return Err(IngestError::StoreWrite {
                    key: path.to_string(),
                    reason: "throttled".to_string(),
                    transient: self.transient,
                });
            }
            self.inner.write(path, data).await
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn size(&self, path: &str) -> Result<usize> {
            self.inner.size(path).await
        }

        fn backend(&self) -> StorageBackend {
            StorageBackend::Memory
        }
    }

    fn setup(io: Arc<dyn IOManager>) -> (ChunkPlan, ChunkWriter) {
        let cells = [(1i64, 1i64), (1, 2), (2, 1), (2, 2), (3, 1), (3, 2)];
        let records = cells
            .iter()
            .enumerate()
            .map(|(i, &(a, b))| {
                Record::new(
                    i as u64,
                    [("inline", a), ("crossline", b)],
                    SampleBuffer::from_samples(&[i as f32, (i * 2) as f32]),
                )
            })
            .collect();
        let index = HeaderIndex::from_columns(
            vec!["inline".into(), "crossline".into()],
            vec![
                cells.iter().map(|c| c.0).collect(),
                cells.iter().map(|c| c.1).collect(),
            ],
            (0..cells.len() as u64).collect(),
            2,
            DataType::F32,
        )
        .unwrap();
        let grid = Arc::new(GridResolver::new().resolve(&index).unwrap());
        let plan = ChunkPlan::new(grid.shape(), &[1, 2]).unwrap().with_samples(2, None).unwrap();
        let writer = ChunkWriter::new(
            Arc::new(MemoryRecordSource::new(records)),
            ArrayStore::new(io),
            grid,
            WriterSettings::default(),
        )
        .unwrap();
        (plan, writer)
    }

    fn fast_retries() -> CoordinatorConfig {
        CoordinatorConfig {
            max_in_flight: 2,
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completed_run() {
        let (plan, writer) = setup(Arc::new(MemoryIOManager::new()));
        let coordinator = Coordinator::new(fast_retries());
        let report = coordinator.run(&plan, &writer).await.unwrap().into_result().unwrap();

        assert_eq!(report.chunks_written, 3);
        assert_eq!(report.cells_covered, 6);
        assert_eq!(report.live_cells, 6);
        assert_eq!(report.stats.count, 12);
        assert_eq!(report.stats.max, 10.0);
        assert!(coordinator.progress().is_done());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (plan, writer) = setup(Arc::new(FlakyIO::new(2, true)));
        let coordinator = Coordinator::new(fast_retries());
        let report = coordinator.run(&plan, &writer).await.unwrap().into_result().unwrap();
        assert_eq!(report.chunks_written, 3);
        assert_eq!(report.retries, 6);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (plan, writer) = setup(Arc::new(FlakyIO::new(10, true)));
        let coordinator = Coordinator::new(CoordinatorConfig {
            max_retries: 2,
            ..fast_retries()
        });
        let outcome = coordinator.run(&plan, &writer).await.unwrap();
        match outcome {
            IngestOutcome::Aborted(IngestError::ChunkFailed { attempts, .. }) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_aborts_without_retry() {
        let (plan, writer) = setup(Arc::new(FlakyIO::new(1, false)));
        let coordinator = Coordinator::new(fast_retries());
        let outcome = coordinator.run(&plan, &writer).await.unwrap();
        match outcome {
            IngestOutcome::Aborted(IngestError::ChunkFailed { attempts, source, .. }) => {
                assert_eq!(attempts, 1);
                assert!(matches!(*source, IngestError::StoreWrite { .. }));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(coordinator.progress().failed >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_aborted() {
        let (plan, writer) = setup(Arc::new(MemoryIOManager::new()));
        let token = CancellationToken::new();
        token.cancel();
        let coordinator = Coordinator::new(fast_retries()).with_cancellation(token);
        let outcome = coordinator.run(&plan, &writer).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Aborted(IngestError::Cancelled)));
        assert!(writer.store().io().list("seismic").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_stored_chunks() {
        let io: Arc<dyn IOManager> = Arc::new(MemoryIOManager::new());
        let (plan, writer) = setup(io.clone());
        let first = Coordinator::new(fast_retries())
            .run(&plan, &writer)
            .await
            .unwrap()
            .into_result()
            .unwrap();

        let resumed = Coordinator::new(CoordinatorConfig {
            resume: true,
            ..fast_retries()
        })
        .run(&plan, &writer)
        .await
        .unwrap()
        .into_result()
        .unwrap();
        assert_eq!(resumed.chunks_recovered, 3);
        assert_eq!(resumed.chunks_written, 0);
        assert_eq!(resumed.stats, first.stats);
    }

    #[test]
    fn test_backoff_is_capped() {
        let coordinator = Coordinator::new(CoordinatorConfig {
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        });
        assert_eq!(coordinator.backoff(1), Duration::from_millis(100));
        assert_eq!(coordinator.backoff(2), Duration::from_millis(200));
        assert_eq!(coordinator.backoff(3), Duration::from_millis(350));
        assert_eq!(coordinator.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_zero_in_flight_is_rejected() {
        let (plan, writer) = setup(Arc::new(MemoryIOManager::new()));
        let coordinator = Coordinator::new(CoordinatorConfig {
            max_in_flight: 0,
            ..Default::default()
        });
        assert!(coordinator.run(&plan, &writer).await.is_err());
    }
}
