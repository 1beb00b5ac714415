//! One migration end to end: task record, table creation, chunked import.
//!
//! Coordinator events arrive on the importer's callback, are forwarded over a
//! channel and written to the task store by a separate task, so a slow store
//! never stalls chunk processing.

use crate::config::MigrationConfig;
use crate::db::{ConnectionFactory, ConnectionPool};
use crate::error::MigrationError;
use crate::import::{
    DdlExecutor, DdlOutcome, ImportEvent, ImportResult, ParallelImporter, PoolChunkExecutor,
    ProgressCallback, StatementCleaner,
};
use crate::tasks::{MigrationTask, TaskStatus, TaskStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub table_name: String,
    pub source_file: PathBuf,
    /// `CREATE TABLE` to run before loading; `None` loads into an existing table.
    pub ddl: Option<String>,
    pub drop_existing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub task: MigrationTask,
    pub ddl: Option<DdlOutcome>,
    pub result: Option<ImportResult>,
}

impl MigrationReport {
    pub fn success(&self) -> bool {
        self.task.status == TaskStatus::Succeeded
    }
}

pub struct Migrator<F: ConnectionFactory, S: TaskStore> {
    pool: ConnectionPool<F>,
    store: Arc<S>,
    config: MigrationConfig,
    cancel: CancellationToken,
}

impl<F: ConnectionFactory, S: TaskStore> Migrator<F, S> {
    pub fn new(pool: ConnectionPool<F>, store: Arc<S>, config: MigrationConfig) -> Self {
        Self {
            pool,
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one migration. The task record is kept current throughout and
    /// holds the final status whether the run succeeds or not.
    pub async fn run(&self, request: MigrationRequest) -> Result<MigrationReport, MigrationError> {
        let mut task = MigrationTask::new(
            request.table_name.clone(),
            request.source_file.display().to_string(),
        );
        task.ddl = request.ddl.clone();
        self.store.create(&task).await?;
        log::info!(
            "migration {} started: {} -> {}",
            task.id,
            task.source_file,
            task.table_name
        );

        let mut ddl_outcome = None;
        if let Some(ddl) = &request.ddl {
            task.set_status(TaskStatus::CreatingTable);
            self.store.update(&task).await?;

            let executor = DdlExecutor::new(self.pool.clone(), self.config.source_schemas.clone());
            let outcome = executor.execute(ddl, request.drop_existing).await;
            if !outcome.success {
                task.fail(format!("table creation failed: {}", outcome.message));
                self.store.update(&task).await?;
                log::error!("migration {} failed: {}", task.id, outcome.message);
                return Ok(MigrationReport {
                    task,
                    ddl: Some(outcome),
                    result: None,
                });
            }
            ddl_outcome = Some(outcome);
        }

        let (tx, rx) = mpsc::unbounded_channel::<ImportEvent>();
        let callback: ProgressCallback = Arc::new(move |event: &ImportEvent| {
            let _ = tx.send(event.clone());
        });
        let writer = tokio::spawn(persist_events(Arc::clone(&self.store), task, rx));

        let cleaner = StatementCleaner::new(self.pool.dialect(), &self.config.source_schemas);
        let importer = ParallelImporter::new(
            PoolChunkExecutor::new(self.pool.clone()),
            cleaner,
            self.config.import_settings(),
        )
        .with_progress(callback)
        .with_cancellation(self.cancel.clone());

        let outcome = importer
            .import_with_retry(&request.table_name, &request.source_file)
            .await;
        // Dropping the importer drops the last sender, which ends the writer.
        drop(importer);
        let mut task = writer.await?;

        match outcome {
            Ok(result) => {
                task.apply_result(&result);
                self.store.update(&task).await?;
                log::info!(
                    "migration {} finished: status={} rows={} failed_chunks={}",
                    task.id,
                    task.status.as_str(),
                    result.total_rows_imported,
                    result.failed_chunks
                );
                Ok(MigrationReport {
                    task,
                    ddl: ddl_outcome,
                    result: Some(result),
                })
            }
            Err(err) => {
                task.fail(err.to_string());
                self.store.update(&task).await?;
                log::error!("migration {} failed: {}", task.id, err);
                Err(err.into())
            }
        }
    }
}

async fn persist_events<S: TaskStore>(
    store: Arc<S>,
    mut task: MigrationTask,
    mut events: mpsc::UnboundedReceiver<ImportEvent>,
) -> MigrationTask {
    while let Some(event) = events.recv().await {
        match &event {
            ImportEvent::Phase { phase, attempt, .. } => {
                let status = TaskStatus::from(*phase);
                // Terminal states are written from the final result.
                if !status.is_terminal() {
                    task.set_status(status);
                }
                task.attempts = task.attempts.max(*attempt as i32 + 1);
            }
            ImportEvent::Progress(progress) => task.apply_progress(progress),
        }
        if let Err(err) = store.update(&task).await {
            log::warn!("failed to persist progress of task {}: {}", task.id, err);
        }
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::tasks::MemoryTaskStore;
    use crate::test_support::StubConnector;
    use std::fs;
    use std::time::Duration;

    fn config(temp_dir: PathBuf) -> MigrationConfig {
        MigrationConfig {
            max_workers: 2,
            chunk_size_mb: 1,
            retry_count: 2,
            temp_dir,
            acquire_timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(1),
            source_schemas: vec!["EMR_HIS".to_string()],
            task_database_url: None,
        }
    }

    async fn migrator(
        connector: &StubConnector,
        config: MigrationConfig,
    ) -> Migrator<StubConnector, MemoryTaskStore> {
        let pool = ConnectionPool::new(connector.clone(), config.pool_options())
            .await
            .unwrap();
        Migrator::new(pool, Arc::new(MemoryTaskStore::new()), config)
    }

    #[tokio::test]
    async fn test_runs_ddl_then_import() {
        let work = tempfile::tempdir().unwrap();
        let dump = work.path().join("patients.sql");
        fs::write(
            &dump,
            "PROMPT loading\nINSERT INTO EMR_HIS.PATIENTS VALUES (1);\nINSERT INTO EMR_HIS.PATIENTS VALUES (2);\n",
        )
        .unwrap();

        let connector = StubConnector::new(Dialect::Doris);
        let migrator = migrator(&connector, config(work.path().join("temp"))).await;

        let report = migrator
            .run(MigrationRequest {
                table_name: "PATIENTS".to_string(),
                source_file: dump,
                ddl: Some("CREATE TABLE EMR_HIS.PATIENTS (ID INT);".to_string()),
                drop_existing: false,
            })
            .await
            .unwrap();

        assert!(report.success());
        assert_eq!(report.result.as_ref().unwrap().total_rows_imported, 2);
        assert!(connector.has_table("patients"));
        assert_eq!(
            connector.executed(),
            vec![
                "INSERT INTO PATIENTS VALUES (1);".to_string(),
                "INSERT INTO PATIENTS VALUES (2);".to_string(),
            ]
        );

        let stored = migrator.store().get(report.task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert_eq!(stored.rows_imported, 2);
        assert_eq!(stored.attempts, 1);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_import_is_recorded() {
        let work = tempfile::tempdir().unwrap();
        let dump = work.path().join("orders.sql");
        fs::write(&dump, "INSERT INTO orders VALUES ('BAD');\n").unwrap();

        let connector = StubConnector::new(Dialect::Postgres);
        connector.fail_statements_containing("BAD");
        let migrator = migrator(&connector, config(work.path().join("temp"))).await;

        let report = migrator
            .run(MigrationRequest {
                table_name: "orders".to_string(),
                source_file: dump,
                ddl: None,
                drop_existing: false,
            })
            .await
            .unwrap();

        assert!(!report.success());
        let stored = migrator.store().get(report.task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempts, 2);
        assert!(stored.error_message.unwrap().starts_with("chunk 0: "));
    }

    #[tokio::test]
    async fn test_missing_dump_fails_migration() {
        let work = tempfile::tempdir().unwrap();
        let connector = StubConnector::new(Dialect::Postgres);
        let migrator = migrator(&connector, config(work.path().join("temp"))).await;

        let err = migrator
            .run(MigrationRequest {
                table_name: "orders".to_string(),
                source_file: work.path().join("missing.sql"),
                ddl: None,
                drop_existing: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Import(_)));

        let tasks = migrator.store().list().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
    }
}
