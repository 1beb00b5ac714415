//! Loading chunks and DDL through the connection pool.

use super::data_structures::ImportChunk;
use super::stats::{ChunkOutcome, FailureKind};
use crate::db::{ConnectionFactory, ConnectionPool, DatabaseConnection};
use crate::dialect::{extract_table_name, translate_ddl, validate_identifier};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

/// Loads one chunk and reports how it went. Failures are values, never errors.
pub trait ChunkExecutor: Send + Sync + 'static {
    fn execute(&self, chunk: ImportChunk) -> impl Future<Output = ChunkOutcome> + Send;
}

/// Runs each chunk in one transaction on one pooled connection.
pub struct PoolChunkExecutor<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
}

impl<F: ConnectionFactory> PoolChunkExecutor<F> {
    pub fn new(pool: ConnectionPool<F>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }
}

impl<F: ConnectionFactory> ChunkExecutor for PoolChunkExecutor<F> {
    async fn execute(&self, chunk: ImportChunk) -> ChunkOutcome {
        let started = Instant::now();
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                log::warn!("chunk {}: could not borrow a connection: {}", chunk.index, err);
                return ChunkOutcome::failed(
                    chunk.index,
                    FailureKind::Acquire,
                    err.to_string(),
                    started.elapsed(),
                );
            }
        };

        if chunk.is_empty() {
            log::debug!("chunk {} of {} has no statements", chunk.index, chunk.table_name);
            drop(conn);
            return ChunkOutcome::succeeded(chunk.index, 0, started.elapsed());
        }

        match conn.execute_batch(&chunk.statements).await {
            Ok(affected_rows) => {
                log::trace!(
                    "chunk {}: committed {} statements, {} rows",
                    chunk.index,
                    chunk.statements.len(),
                    affected_rows
                );
                ChunkOutcome::succeeded(chunk.index, affected_rows, started.elapsed())
            }
            Err(err) => {
                if err.is_connection_lost() {
                    conn.discard();
                }
                log::warn!("chunk {}: rolled back: {}", chunk.index, err);
                ChunkOutcome::failed(
                    chunk.index,
                    FailureKind::Statement,
                    err.to_string(),
                    started.elapsed(),
                )
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdlOutcome {
    pub success: bool,
    pub table_name: Option<String>,
    /// The table already existed and was left untouched.
    pub skipped_existing: bool,
    pub message: String,
    pub elapsed: Duration,
}

impl DdlOutcome {
    fn failed(table_name: Option<String>, message: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            table_name,
            skipped_existing: false,
            message: message.into(),
            elapsed: started.elapsed(),
        }
    }
}

/// Creates destination tables with the same pool discipline as chunk loads.
pub struct DdlExecutor<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    source_schemas: Vec<String>,
}

impl<F: ConnectionFactory> DdlExecutor<F> {
    pub fn new(pool: ConnectionPool<F>, source_schemas: Vec<String>) -> Self {
        Self {
            pool,
            source_schemas,
        }
    }

    /// Translate and run one `CREATE TABLE`.
    ///
    /// With `drop_existing` an existing table of the same name is dropped
    /// first; without it an existing table is kept and reported as skipped.
    pub async fn execute(&self, ddl: &str, drop_existing: bool) -> DdlOutcome {
        let started = Instant::now();

        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => return DdlOutcome::failed(None, err.to_string(), started),
        };

        let ddl = translate_ddl(conn.dialect(), ddl, &self.source_schemas);
        let Some(table) = extract_table_name(&ddl) else {
            return DdlOutcome::failed(None, "no CREATE TABLE statement found in DDL", started);
        };
        if let Err(err) = validate_identifier(&table) {
            return DdlOutcome::failed(Some(table), err.to_string(), started);
        }

        let exists = match conn.table_exists(&table).await {
            Ok(exists) => exists,
            Err(err) => return DdlOutcome::failed(Some(table), err.to_string(), started),
        };

        if exists {
            if !drop_existing {
                log::info!("table {} already exists, keeping it", table);
                return DdlOutcome {
                    success: true,
                    table_name: Some(table.clone()),
                    skipped_existing: true,
                    message: format!("table {} already exists", table),
                    elapsed: started.elapsed(),
                };
            }
            log::info!("dropping existing table {}", table);
            if let Err(err) = conn.drop_table(&table).await {
                return DdlOutcome::failed(Some(table), err.to_string(), started);
            }
        }

        match conn.execute_ddl(&ddl).await {
            Ok(()) => {
                log::info!("created table {}", table);
                DdlOutcome {
                    success: true,
                    table_name: Some(table.clone()),
                    skipped_existing: false,
                    message: format!("table {} created", table),
                    elapsed: started.elapsed(),
                }
            }
            Err(err) => {
                log::error!("failed to create table {}: {}", table, err);
                DdlOutcome::failed(Some(table), err.to_string(), started)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PoolOptions;
    use crate::dialect::Dialect;
    use crate::test_support::StubConnector;
    use std::path::PathBuf;

    fn chunk(index: usize, statements: &[&str]) -> ImportChunk {
        ImportChunk {
            index,
            table_name: "t".to_string(),
            path: PathBuf::from(format!("t_chunk_{:06}.sql", index)),
            statements: statements.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn pool(connector: &StubConnector) -> ConnectionPool<StubConnector> {
        ConnectionPool::new(
            connector.clone(),
            PoolOptions {
                max_size: 2,
                initial_size: 1,
                acquire_timeout: Duration::from_millis(100),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_chunk_commits_all_statements() {
        let connector = StubConnector::new(Dialect::Postgres);
        let executor = PoolChunkExecutor::new(pool(&connector).await);

        let outcome = executor
            .execute(chunk(0, &["INSERT INTO t VALUES (1);", "INSERT INTO t VALUES (2);"]))
            .await;

        assert!(outcome.success());
        assert_eq!(outcome.affected_rows, 2);
        assert_eq!(connector.executed().len(), 2);
        assert_eq!(executor.pool().status().borrowed, 0);
    }

    #[tokio::test]
    async fn test_statement_failure_counts_no_rows() {
        let connector = StubConnector::new(Dialect::Postgres);
        connector.fail_statements_containing("BAD");
        let executor = PoolChunkExecutor::new(pool(&connector).await);

        let outcome = executor
            .execute(chunk(3, &["INSERT INTO t VALUES (1);", "INSERT INTO t VALUES (BAD);"]))
            .await;

        assert!(!outcome.success());
        assert_eq!(outcome.affected_rows, 0);
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Statement));
        assert!(connector.executed().is_empty());
        assert_eq!(executor.pool().status().borrowed, 0);
    }

    #[tokio::test]
    async fn test_empty_chunk_borrows_without_executing() {
        let connector = StubConnector::new(Dialect::Postgres);
        let executor = PoolChunkExecutor::new(pool(&connector).await);
        connector.fail_next_pings(1);

        let outcome = executor.execute(chunk(1, &[])).await;
        assert!(outcome.success());
        assert_eq!(outcome.affected_rows, 0);
        assert!(connector.executed().is_empty());
        // The dead idle session was probed and replaced on the way through.
        assert_eq!(connector.connect_count(), 2);
        let status = executor.pool().status();
        assert_eq!(status.borrowed, 0);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_empty_chunk_waits_for_a_connection() {
        let connector = StubConnector::new(Dialect::Postgres);
        let executor = PoolChunkExecutor::new(pool(&connector).await);
        let _first = executor.pool().acquire().await.unwrap();
        let _second = executor.pool().acquire().await.unwrap();

        let outcome = executor.execute(chunk(2, &[])).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Acquire));
    }

    #[tokio::test]
    async fn test_acquire_failure_is_reported() {
        let connector = StubConnector::new(Dialect::Doris);
        let executor = PoolChunkExecutor::new(pool(&connector).await);
        connector.fail_connections(true);
        connector.fail_next_pings(1);

        let outcome = executor.execute(chunk(0, &["INSERT INTO t VALUES (1);"])).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Acquire));
    }

    #[tokio::test]
    async fn test_ddl_creates_and_skips_existing() {
        let connector = StubConnector::new(Dialect::Postgres);
        let ddl = DdlExecutor::new(pool(&connector).await, vec!["EMR_HIS".to_string()]);

        let created = ddl
            .execute("CREATE TABLE EMR_HIS.patients (id INT, name VARCHAR2(20));", false)
            .await;
        assert!(created.success);
        assert!(!created.skipped_existing);
        assert_eq!(created.table_name.as_deref(), Some("patients"));
        assert!(connector.has_table("patients"));
        assert_eq!(
            connector.ddl_log(),
            vec!["CREATE TABLE patients (id INTEGER, name VARCHAR(20));".to_string()]
        );

        let again = ddl.execute("CREATE TABLE patients (id INT);", false).await;
        assert!(again.success);
        assert!(again.skipped_existing);
        assert_eq!(connector.ddl_log().len(), 1);
    }

    #[tokio::test]
    async fn test_ddl_drops_existing_when_asked() {
        let connector = StubConnector::new(Dialect::Doris);
        connector.add_table("orders");
        let ddl = DdlExecutor::new(pool(&connector).await, Vec::new());

        let outcome = ddl.execute("CREATE TABLE orders (id INT);", true).await;
        assert!(outcome.success);
        assert_eq!(
            connector.ddl_log(),
            vec![
                "DROP TABLE IF EXISTS orders".to_string(),
                "CREATE TABLE orders (id INT);".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ddl_without_table_name_fails() {
        let connector = StubConnector::new(Dialect::Doris);
        let ddl = DdlExecutor::new(pool(&connector).await, Vec::new());

        let outcome = ddl.execute("SELECT 1", false).await;
        assert!(!outcome.success);
        assert!(outcome.table_name.is_none());
    }
}
