use super::{MigrationTask, TaskStore, TaskStoreError};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const SELECT_TASK: &str = r#"SELECT id, table_name, source_file, status, ddl, total_chunks,
       completed_chunks, failed_chunks, rows_imported, progress_percent, attempts,
       error_message, created_at, updated_at, completed_at
  FROM migration_tasks"#;

/// Task store backed by the `migration_tasks` table.
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and bring the task schema up to date.
    pub async fn connect(url: &str) -> Result<Self, TaskStoreError> {
        let pool = PgPoolOptions::new().max_connections(4).connect(url).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), TaskStoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

impl TaskStore for PgTaskStore {
    async fn create(&self, task: &MigrationTask) -> Result<(), TaskStoreError> {
        sqlx::query(
            r#"INSERT INTO migration_tasks
                   (id, table_name, source_file, status, ddl, total_chunks, completed_chunks,
                    failed_chunks, rows_imported, progress_percent, attempts, error_message,
                    created_at, updated_at, completed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(task.id)
        .bind(&task.table_name)
        .bind(&task.source_file)
        .bind(task.status)
        .bind(&task.ddl)
        .bind(task.total_chunks)
        .bind(task.completed_chunks)
        .bind(task.failed_chunks)
        .bind(task.rows_imported)
        .bind(task.progress_percent)
        .bind(task.attempts)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MigrationTask>, TaskStoreError> {
        let sql = format!("{} WHERE id = $1", SELECT_TASK);
        let task = sqlx::query_as::<_, MigrationTask>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    async fn update(&self, task: &MigrationTask) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            r#"UPDATE migration_tasks
                  SET status = $2, ddl = $3, total_chunks = $4, completed_chunks = $5,
                      failed_chunks = $6, rows_imported = $7, progress_percent = $8,
                      attempts = $9, error_message = $10, updated_at = $11, completed_at = $12
                WHERE id = $1"#,
        )
        .bind(task.id)
        .bind(task.status)
        .bind(&task.ddl)
        .bind(task.total_chunks)
        .bind(task.completed_chunks)
        .bind(task.failed_chunks)
        .bind(task.rows_imported)
        .bind(task.progress_percent)
        .bind(task.attempts)
        .bind(&task.error_message)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task.id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MigrationTask>, TaskStoreError> {
        let sql = format!("{} ORDER BY created_at DESC", SELECT_TASK);
        let tasks = sqlx::query_as::<_, MigrationTask>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(tasks)
    }
}
