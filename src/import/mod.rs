//! Chunked parallel import of dump files.
//!
//! The pipeline, leaf first:
//!
//! 1. **Cleaning** (`cleaner`) - drops directives and comments, keeps complete INSERTs
//! 2. **Splitting** (`splitter`) - streams the dump into line-aligned chunk files
//! 3. **Execution** (`executor`) - loads one chunk per transaction through the pool
//! 4. **Coordination** (`coordinator`) - fans chunks out, aggregates, retries
//! 5. **Progress** (`progress`) and **statistics** (`stats`) - counters and results
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use dump_migrator::import::{ImportSettings, ParallelImporter, PoolChunkExecutor, StatementCleaner};
//!
//! let importer = ParallelImporter::new(
//!     PoolChunkExecutor::new(pool),
//!     StatementCleaner::new(Dialect::Doris, &[]),
//!     ImportSettings::default(),
//! );
//! let result = importer.import_with_retry("patients", Path::new("patients.sql")).await?;
//! println!("imported {} rows", result.total_rows_imported);
//! ```

pub mod cleaner;
pub mod coordinator;
pub mod data_structures;
pub mod executor;
pub mod progress;
pub mod splitter;
pub mod stats;

pub use cleaner::StatementCleaner;
pub use coordinator::{ImportError, ImportSettings, ParallelImporter};
pub use data_structures::ImportChunk;
pub use executor::{ChunkExecutor, DdlExecutor, DdlOutcome, PoolChunkExecutor};
pub use progress::{
    ImportEvent, ImportPhase, ProgressCallback, ProgressEvent, ProgressMonitor, ProgressSnapshot,
};
pub use splitter::{ChunkSet, FileSplitter, SplitError};
pub use stats::{ChunkFailure, ChunkOutcome, FailureKind, ImportResult};
