//! Per-chunk outcomes and their per-pass aggregate.

use serde::{Serialize, Serializer};
use std::time::Duration;

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Why a chunk failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No connection could be borrowed.
    Acquire,
    /// The chunk's scratch file could not be read.
    Load,
    /// A statement was rejected; the chunk's transaction was rolled back.
    Statement,
    /// Not attempted because the pass was aborted.
    Skipped,
    /// The worker running the chunk panicked.
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of loading one chunk in one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkOutcome {
    pub index: usize,
    /// Rows committed by this chunk; always zero on failure.
    pub affected_rows: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub failure: Option<ChunkFailure>,
}

impl ChunkOutcome {
    pub fn succeeded(index: usize, affected_rows: u64, elapsed: Duration) -> Self {
        Self {
            index,
            affected_rows,
            elapsed,
            failure: None,
        }
    }

    pub fn failed(
        index: usize,
        kind: FailureKind,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            index,
            affected_rows: 0,
            elapsed,
            failure: Some(ChunkFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|failure| failure.kind)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|failure| failure.message.as_str())
    }
}

/// Aggregate of one pass over a dump file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportResult {
    pub table_name: String,
    /// Passes run so far, including this one.
    pub attempts: u32,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    pub total_rows_imported: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub total_elapsed: Duration,
    pub success: bool,
    /// `chunk <index>: <message>` entries in completion order.
    pub error_messages: Vec<String>,
}

impl ImportResult {
    pub fn new(table_name: impl Into<String>, total_chunks: usize) -> Self {
        Self {
            table_name: table_name.into(),
            attempts: 1,
            total_chunks,
            completed_chunks: 0,
            failed_chunks: 0,
            total_rows_imported: 0,
            total_elapsed: Duration::ZERO,
            success: false,
            error_messages: Vec::new(),
        }
    }

    /// Fold one chunk outcome into the totals.
    pub fn record(&mut self, outcome: &ChunkOutcome) {
        match &outcome.failure {
            None => {
                self.completed_chunks += 1;
                self.total_rows_imported += outcome.affected_rows;
            }
            Some(failure) => {
                self.failed_chunks += 1;
                self.error_messages
                    .push(format!("chunk {}: {}", outcome.index, failure.message));
            }
        }
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.total_elapsed = elapsed;
        self.success = self.failed_chunks == 0;
    }

    /// All chunk errors joined into one human-readable message.
    pub fn aggregate_error(&self) -> Option<String> {
        if self.error_messages.is_empty() {
            None
        } else {
            Some(self.error_messages.join("; "))
        }
    }
}
