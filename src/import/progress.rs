//! Pass progress counters and the events derived from them.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Consistent read of the counters, taken under the monitor's lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub affected_rows: u64,
    pub percent: f64,
}

impl ProgressSnapshot {
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.processed() == self.total
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed: usize,
    failed: usize,
    affected_rows: u64,
}

/// Thread-safe completed/failed counters for one pass.
#[derive(Debug)]
pub struct ProgressMonitor {
    total: usize,
    counters: Mutex<Counters>,
}

impl ProgressMonitor {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn record_success(&self, affected_rows: u64) -> ProgressSnapshot {
        let mut counters = self.counters.lock();
        if counters.completed + counters.failed < self.total {
            counters.completed += 1;
            counters.affected_rows += affected_rows;
        } else {
            log::warn!("ignoring progress update past {} chunks", self.total);
        }
        self.snapshot_of(&counters)
    }

    pub fn record_failure(&self) -> ProgressSnapshot {
        let mut counters = self.counters.lock();
        if counters.completed + counters.failed < self.total {
            counters.failed += 1;
        } else {
            log::warn!("ignoring progress update past {} chunks", self.total);
        }
        self.snapshot_of(&counters)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let counters = self.counters.lock();
        self.snapshot_of(&counters)
    }

    fn snapshot_of(&self, counters: &Counters) -> ProgressSnapshot {
        let processed = counters.completed + counters.failed;
        let percent = if self.total == 0 {
            100.0
        } else {
            processed as f64 / self.total as f64 * 100.0
        };
        ProgressSnapshot {
            total: self.total,
            completed: counters.completed,
            failed: counters.failed,
            affected_rows: counters.affected_rows,
            percent,
        }
    }
}

/// Stage of the coordinator's per-pass state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Splitting,
    Executing,
    Aggregating,
    Succeeded,
    Failed,
}

/// Payload delivered after every processed chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub table_name: String,
    pub attempt: u32,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    pub total_chunks: usize,
    pub total_affected_rows: u64,
    pub progress_percent: f64,
}

impl ProgressEvent {
    pub fn from_snapshot(table_name: &str, attempt: u32, snapshot: ProgressSnapshot) -> Self {
        Self {
            table_name: table_name.to_string(),
            attempt,
            completed_chunks: snapshot.completed,
            failed_chunks: snapshot.failed,
            total_chunks: snapshot.total,
            total_affected_rows: snapshot.affected_rows,
            progress_percent: snapshot.percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportEvent {
    Phase {
        table_name: String,
        attempt: u32,
        phase: ImportPhase,
        total_chunks: Option<usize>,
    },
    Progress(ProgressEvent),
}

/// Fire-and-forget observer of import events. Panics raised inside it are
/// caught by the caller and never abort a pass.
pub type ProgressCallback = Arc<dyn Fn(&ImportEvent) + Send + Sync>;
