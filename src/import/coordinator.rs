//! Parallel import coordination.
//!
//! [`ParallelImporter::import_with_retry`] drives whole-file passes:
//! 1. Split the dump into fresh chunk files
//! 2. Load every chunk concurrently, at most `min(chunks, pool_size)` at a time
//! 3. Aggregate outcomes as they complete and report progress
//! 4. Delete the chunk files
//! 5. Retry the whole pass with exponential backoff while chunks failed

use super::cleaner::StatementCleaner;
use super::data_structures::ImportChunk;
use super::executor::ChunkExecutor;
use super::progress::{
    ImportEvent, ImportPhase, ProgressCallback, ProgressEvent, ProgressMonitor,
};
use super::splitter::{FileSplitter, SplitError};
use super::stats::{ChunkOutcome, FailureKind, ImportResult};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Upper bound on the backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to split dump file: {0}")]
    Split(#[from] SplitError),
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),
    #[error("import cancelled")]
    Cancelled,
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    pub max_chunk_bytes: u64,
    /// Upper bound on concurrently loading chunks.
    pub pool_size: usize,
    /// Passes allowed per import; zero behaves like one.
    pub retry_count: u32,
    pub temp_dir: PathBuf,
    pub backoff_base: Duration,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 30 * 1024 * 1024,
            pool_size: 8,
            retry_count: 3,
            temp_dir: PathBuf::from("./temp"),
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl ImportSettings {
    /// Delay before the pass following `attempt` (0-based): `base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << attempt.min(MAX_BACKOFF_SHIFT))
    }
}

pub struct ParallelImporter<E: ChunkExecutor> {
    executor: Arc<E>,
    cleaner: Arc<StatementCleaner>,
    settings: ImportSettings,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl<E: ChunkExecutor> ParallelImporter<E> {
    pub fn new(executor: E, cleaner: StatementCleaner, settings: ImportSettings) -> Self {
        Self {
            executor: Arc::new(executor),
            cleaner: Arc::new(cleaner),
            settings,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Checked before every pass; also cuts a pending backoff short.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Import `source` into `table_name`, retrying failed passes.
    ///
    /// Returns the result of the first fully successful pass, or of the last
    /// pass once the retry budget is spent. Split failures and an unreachable
    /// destination are retried too, and returned as errors when they happen on
    /// the last pass.
    pub async fn import_with_retry(
        &self,
        table_name: &str,
        source: &Path,
    ) -> Result<ImportResult, ImportError> {
        let attempts = self.settings.retry_count.max(1);
        let mut attempt = 0;

        loop {
            if self.cancel.is_cancelled() {
                log::info!("import of {} cancelled before attempt {}", table_name, attempt + 1);
                self.emit_phase(table_name, attempt, ImportPhase::Failed, None);
                return Err(ImportError::Cancelled);
            }

            let last = attempt + 1 >= attempts;
            match self.run_pass(table_name, source, attempt).await {
                Ok(mut result) => {
                    result.attempts = attempt + 1;
                    if result.success {
                        log::info!(
                            "imported {} rows into {} from {} chunks in {:.2?} (attempt {})",
                            result.total_rows_imported,
                            table_name,
                            result.total_chunks,
                            result.total_elapsed,
                            result.attempts
                        );
                        self.emit_phase(table_name, attempt, ImportPhase::Succeeded, None);
                        return Ok(result);
                    }
                    if last {
                        log::error!(
                            "import of {} failed after {} attempts: {} of {} chunks failed",
                            table_name,
                            result.attempts,
                            result.failed_chunks,
                            result.total_chunks
                        );
                        self.emit_phase(table_name, attempt, ImportPhase::Failed, None);
                        return Ok(result);
                    }
                    log::warn!(
                        "attempt {} of {} for {}: {} of {} chunks failed",
                        attempt + 1,
                        attempts,
                        table_name,
                        result.failed_chunks,
                        result.total_chunks
                    );
                }
                Err(ImportError::Cancelled) => {
                    self.emit_phase(table_name, attempt, ImportPhase::Failed, None);
                    return Err(ImportError::Cancelled);
                }
                Err(err) if last => {
                    log::error!("import of {} failed: {}", table_name, err);
                    self.emit_phase(table_name, attempt, ImportPhase::Failed, None);
                    return Err(err);
                }
                Err(err) => {
                    log::warn!(
                        "attempt {} of {} for {} aborted: {}",
                        attempt + 1,
                        attempts,
                        table_name,
                        err
                    );
                }
            }

            let delay = self.settings.backoff(attempt);
            log::debug!("retrying import of {} in {:?}", table_name, delay);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.emit_phase(table_name, attempt, ImportPhase::Failed, None);
                    return Err(ImportError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One split-execute-aggregate pass. Chunk files are removed before returning.
    async fn run_pass(
        &self,
        table_name: &str,
        source: &Path,
        attempt: u32,
    ) -> Result<ImportResult, ImportError> {
        let started = Instant::now();
        self.emit_phase(table_name, attempt, ImportPhase::Splitting, None);

        let splitter = FileSplitter::new(&self.settings.temp_dir, self.settings.max_chunk_bytes);
        let chunks = {
            let source = source.to_path_buf();
            let table = table_name.to_string();
            tokio::task::spawn_blocking(move || splitter.split(&source, &table)).await??
        };
        log::debug!(
            "attempt {} for {}: {} chunks in {}",
            attempt + 1,
            table_name,
            chunks.len(),
            chunks.dir().display()
        );

        self.emit_phase(table_name, attempt, ImportPhase::Executing, Some(chunks.len()));
        let outcome = self
            .execute_chunks(table_name, attempt, chunks.paths())
            .await;

        let scratch = chunks.dir().to_path_buf();
        match tokio::task::spawn_blocking(move || chunks.cleanup()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("failed to remove {}: {}", scratch.display(), err),
            Err(err) => log::warn!("failed to remove {}: {}", scratch.display(), err),
        }

        let mut result = outcome?;
        result.finish(started.elapsed());
        Ok(result)
    }

    async fn execute_chunks(
        &self,
        table_name: &str,
        attempt: u32,
        paths: &[PathBuf],
    ) -> Result<ImportResult, ImportError> {
        let total = paths.len();
        let mut result = ImportResult::new(table_name, total);
        if total == 0 {
            self.emit_phase(table_name, attempt, ImportPhase::Aggregating, Some(0));
            return Ok(result);
        }

        let workers = total.min(self.settings.pool_size.max(1));
        let semaphore = Arc::new(Semaphore::new(workers));
        let abort = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<ChunkOutcome>();
        let mut tasks = JoinSet::new();

        for (index, path) in paths.iter().enumerate() {
            let job = ChunkJob {
                index,
                table_name: table_name.to_string(),
                path: path.clone(),
                executor: Arc::clone(&self.executor),
                cleaner: Arc::clone(&self.cleaner),
                semaphore: Arc::clone(&semaphore),
                abort: Arc::clone(&abort),
            };
            let tx = tx.clone();
            tasks.spawn(async move {
                let _ = tx.send(job.run().await);
            });
        }
        drop(tx);

        let monitor = ProgressMonitor::new(total);
        let mut reported = vec![false; total];
        let mut observed = 0usize;
        let mut leading_acquire_failures = 0usize;
        let mut unreachable: Option<String> = None;

        while let Some(outcome) = rx.recv().await {
            if let Some(seen) = reported.get_mut(outcome.index) {
                *seen = true;
            }

            observed += 1;
            if observed <= workers && outcome.failure_kind() == Some(FailureKind::Acquire) {
                leading_acquire_failures += 1;
                if leading_acquire_failures == workers {
                    abort.store(true, Ordering::SeqCst);
                    let message = outcome.error_message().unwrap_or_default().to_string();
                    log::error!(
                        "first {} chunks of {} could not borrow a connection; skipping the rest",
                        workers,
                        table_name
                    );
                    unreachable = Some(message);
                }
            }

            self.record(&mut result, &monitor, table_name, attempt, &outcome);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    log::error!("chunk worker for {} panicked", table_name);
                } else {
                    log::warn!("chunk worker for {} did not finish: {}", table_name, err);
                }
            }
        }

        for (index, seen) in reported.iter().enumerate() {
            if !seen {
                let outcome =
                    ChunkOutcome::failed(index, FailureKind::Panicked, "worker panicked", Duration::ZERO);
                self.record(&mut result, &monitor, table_name, attempt, &outcome);
            }
        }

        self.emit_phase(table_name, attempt, ImportPhase::Aggregating, Some(total));

        match unreachable {
            Some(message) => Err(ImportError::DestinationUnreachable(message)),
            None => Ok(result),
        }
    }

    fn record(
        &self,
        result: &mut ImportResult,
        monitor: &ProgressMonitor,
        table_name: &str,
        attempt: u32,
        outcome: &ChunkOutcome,
    ) {
        result.record(outcome);
        let snapshot = if outcome.success() {
            monitor.record_success(outcome.affected_rows)
        } else {
            monitor.record_failure()
        };
        log::debug!(
            "{}: {}/{} chunks processed ({:.1}%)",
            table_name,
            snapshot.processed(),
            snapshot.total,
            snapshot.percent
        );
        self.emit(&ImportEvent::Progress(ProgressEvent::from_snapshot(
            table_name, attempt, snapshot,
        )));
    }

    fn emit_phase(
        &self,
        table_name: &str,
        attempt: u32,
        phase: ImportPhase,
        total_chunks: Option<usize>,
    ) {
        self.emit(&ImportEvent::Phase {
            table_name: table_name.to_string(),
            attempt,
            phase,
            total_chunks,
        });
    }

    fn emit(&self, event: &ImportEvent) {
        let Some(callback) = &self.progress else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| (callback.as_ref())(event))).is_err() {
            log::warn!("progress callback panicked; continuing");
        }
    }
}

/// Everything one spawned chunk task needs.
struct ChunkJob<E: ChunkExecutor> {
    index: usize,
    table_name: String,
    path: PathBuf,
    executor: Arc<E>,
    cleaner: Arc<StatementCleaner>,
    semaphore: Arc<Semaphore>,
    abort: Arc<AtomicBool>,
}

impl<E: ChunkExecutor> ChunkJob<E> {
    async fn run(self) -> ChunkOutcome {
        let started = Instant::now();
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return ChunkOutcome::failed(
                self.index,
                FailureKind::Skipped,
                "worker pool closed",
                started.elapsed(),
            );
        };

        if self.abort.load(Ordering::SeqCst) {
            return ChunkOutcome::failed(
                self.index,
                FailureKind::Skipped,
                "skipped: destination unreachable",
                started.elapsed(),
            );
        }

        let loaded = {
            let cleaner = Arc::clone(&self.cleaner);
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || cleaner.load_chunk(&path)).await
        };
        let statements = match loaded {
            Ok(Ok(statements)) => statements,
            Ok(Err(err)) => {
                return ChunkOutcome::failed(
                    self.index,
                    FailureKind::Load,
                    format!("failed to read {}: {}", self.path.display(), err),
                    started.elapsed(),
                );
            }
            Err(err) => {
                return ChunkOutcome::failed(
                    self.index,
                    FailureKind::Load,
                    format!("statement loader failed: {}", err),
                    started.elapsed(),
                );
            }
        };

        let chunk = ImportChunk {
            index: self.index,
            table_name: self.table_name,
            path: self.path,
            statements,
        };
        self.executor.execute(chunk).await
    }
}
