//! Migration task records and their stores.
//!
//! A task mirrors one migration's progress through the coordinator's state
//! machine. Stores are injected wherever task state is read or written; the
//! in-memory store backs tests and one-shot CLI runs, the PostgreSQL store
//! keeps history across runs.

pub mod memory;
pub mod postgres;

use crate::import::{ImportPhase, ImportResult, ProgressEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    CreatingTable,
    Splitting,
    Executing,
    Aggregating,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::CreatingTable => "creating_table",
            TaskStatus::Splitting => "splitting",
            TaskStatus::Executing => "executing",
            TaskStatus::Aggregating => "aggregating",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl From<ImportPhase> for TaskStatus {
    fn from(phase: ImportPhase) -> Self {
        match phase {
            ImportPhase::Splitting => TaskStatus::Splitting,
            ImportPhase::Executing => TaskStatus::Executing,
            ImportPhase::Aggregating => TaskStatus::Aggregating,
            ImportPhase::Succeeded => TaskStatus::Succeeded,
            ImportPhase::Failed => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct MigrationTask {
    pub id: Uuid,
    pub table_name: String,
    pub source_file: String,
    pub status: TaskStatus,
    pub ddl: Option<String>,
    pub total_chunks: i64,
    pub completed_chunks: i64,
    pub failed_chunks: i64,
    pub rows_imported: i64,
    pub progress_percent: f64,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationTask {
    pub fn new(table_name: impl Into<String>, source_file: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            table_name: table_name.into(),
            source_file: source_file.into(),
            status: TaskStatus::Pending,
            ddl: None,
            total_chunks: 0,
            completed_chunks: 0,
            failed_chunks: 0,
            rows_imported: 0,
            progress_percent: 0.0,
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at.get_or_insert(now);
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.set_status(TaskStatus::Failed);
    }

    pub fn apply_progress(&mut self, event: &ProgressEvent) {
        self.attempts = self.attempts.max(event.attempt as i32 + 1);
        self.total_chunks = event.total_chunks as i64;
        self.completed_chunks = event.completed_chunks as i64;
        self.failed_chunks = event.failed_chunks as i64;
        self.rows_imported = event.total_affected_rows as i64;
        self.progress_percent = event.progress_percent;
        self.updated_at = Utc::now();
    }

    /// Copy the final numbers of an import and close the task.
    pub fn apply_result(&mut self, result: &ImportResult) {
        self.attempts = result.attempts as i32;
        self.total_chunks = result.total_chunks as i64;
        self.completed_chunks = result.completed_chunks as i64;
        self.failed_chunks = result.failed_chunks as i64;
        self.rows_imported = result.total_rows_imported as i64;
        let processed = result.completed_chunks + result.failed_chunks;
        self.progress_percent = if result.total_chunks == 0 {
            100.0
        } else {
            processed as f64 / result.total_chunks as f64 * 100.0
        };
        if result.success {
            self.error_message = None;
            self.set_status(TaskStatus::Succeeded);
        } else {
            self.fail(result.aggregate_error().unwrap_or_default());
        }
    }
}

/// Create/get/update/list access to task records.
pub trait TaskStore: Send + Sync + 'static {
    fn create(
        &self,
        task: &MigrationTask,
    ) -> impl Future<Output = Result<(), TaskStoreError>> + Send;

    fn get(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<MigrationTask>, TaskStoreError>> + Send;

    /// Replace a stored task; fails with `NotFound` for unknown ids.
    fn update(
        &self,
        task: &MigrationTask,
    ) -> impl Future<Output = Result<(), TaskStoreError>> + Send;

    /// All tasks, newest first.
    fn list(&self) -> impl Future<Output = Result<Vec<MigrationTask>, TaskStoreError>> + Send;
}
