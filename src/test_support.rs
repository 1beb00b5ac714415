//! Doubles and fixtures shared by unit and integration tests.

pub use database::{TestDatabaseError, TestPostgres};

use crate::db::{ConnectionFactory, DatabaseConnection, DbError};
use crate::dialect::{Dialect, extract_table_name, validate_identifier};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct StubState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    fail_connect: AtomicBool,
    failing_pings: AtomicUsize,
    fail_marker: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
    executed: Mutex<Vec<String>>,
    ddl: Mutex<Vec<String>>,
    tables: Mutex<HashSet<String>>,
}

/// In-memory destination database. Clones share state, so a test keeps one
/// handle for assertions while the pool owns another.
#[derive(Debug, Clone)]
pub struct StubConnector {
    dialect: Dialect,
    state: Arc<StubState>,
}

impl StubConnector {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::new(StubState::default()),
        }
    }

    /// Make every following `connect` fail (or succeed again).
    pub fn fail_connections(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Report the next `count` pings as dead sessions.
    pub fn fail_next_pings(&self, count: usize) {
        self.state.failing_pings.store(count, Ordering::SeqCst);
    }

    /// Reject any batch containing a statement with `marker` in it.
    pub fn fail_statements_containing(&self, marker: &str) {
        *self.state.fail_marker.lock() = Some(marker.to_string());
    }

    /// Sleep this long inside every batch.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Sleep this long before every `connect` completes.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Sleep this long inside every `ping`.
    pub fn set_ping_delay(&self, delay: Duration) {
        *self.state.ping_delay.lock() = delay;
    }

    pub fn add_table(&self, table: &str) {
        self.state.tables.lock().insert(table.to_lowercase());
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.tables.lock().contains(&table.to_lowercase())
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Statements from committed batches, in commit order.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    pub fn ddl_log(&self) -> Vec<String> {
        self.state.ddl.lock().clone()
    }
}

impl ConnectionFactory for StubConnector {
    type Connection = StubConnection;

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn connect(&self) -> Result<StubConnection, DbError> {
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionLost("connection refused".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(StubConnection {
            dialect: self.dialect,
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct StubConnection {
    dialect: Dialect,
    state: Arc<StubState>,
}

impl DatabaseConnection for StubConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        let delay = *self.state.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let dead = self
            .state
            .failing_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if dead {
            Err(DbError::ConnectionLost("server closed the connection".to_string()))
        } else {
            Ok(())
        }
    }

    async fn execute_batch(&mut self, statements: &[String]) -> Result<u64, DbError> {
        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let marker = self.state.fail_marker.lock().clone();
        if let Some(marker) = marker {
            if let Some(bad) = statements.iter().find(|s| s.contains(&marker)) {
                return Err(DbError::Execution(format!("statement rejected: {}", bad)));
            }
        }

        self.state.executed.lock().extend(statements.iter().cloned());
        Ok(statements.len() as u64)
    }

    async fn execute_ddl(&mut self, ddl: &str) -> Result<(), DbError> {
        self.state.ddl.lock().push(ddl.to_string());
        if let Some(table) = extract_table_name(ddl) {
            self.state.tables.lock().insert(table.to_lowercase());
        }
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        let table = validate_identifier(table)?;
        Ok(self.state.tables.lock().contains(&table.to_lowercase()))
    }

    async fn drop_table(&mut self, table: &str) -> Result<(), DbError> {
        let table = validate_identifier(table)?;
        self.state.ddl.lock().push(format!("DROP TABLE IF EXISTS {}", table));
        self.state.tables.lock().remove(&table.to_lowercase());
        Ok(())
    }

    async fn close(self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub mod database {
    use crate::config::DatabaseConfig;
    use crate::dialect::Dialect;
    use crate::tasks::{PgTaskStore, TaskStoreError};
    use log::LevelFilter;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use sqlx::{ConnectOptions, PgPool};
    use testcontainers::ImageExt;
    use testcontainers_modules::postgres::Postgres;
    use testcontainers_modules::testcontainers::{
        ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
    };
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum TestDatabaseError {
        #[error("database error: {0}")]
        Sqlx(#[from] sqlx::Error),
        #[error("task store error: {0}")]
        TaskStore(#[from] TaskStoreError),
        #[error("container error: {0}")]
        Container(#[from] TestcontainersError),
    }

    /// Disposable PostgreSQL server with the task-store schema applied.
    pub struct TestPostgres {
        config: DatabaseConfig,
        pool: PgPool,
        _container: ContainerAsync<Postgres>,
    }

    impl TestPostgres {
        pub async fn start() -> Result<Self, TestDatabaseError> {
            let container = Postgres::default().with_tag("16-alpine").start().await?;
            let host = container.get_host().await?.to_string();
            let port = container.get_host_port_ipv4(5432).await?;

            let config = DatabaseConfig {
                host,
                port,
                user: "postgres".to_string(),
                password: "postgres".to_string(),
                database: "postgres".to_string(),
                ..DatabaseConfig::for_dialect(Dialect::Postgres)
            };

            let options = PgConnectOptions::new()
                .host(&config.host)
                .port(config.port)
                .username(&config.user)
                .password(&config.password)
                .database(&config.database)
                .log_statements(LevelFilter::Off);
            let pool = PgPoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?;

            PgTaskStore::new(pool.clone()).migrate().await?;

            Ok(Self {
                config,
                pool,
                _container: container,
            })
        }

        pub fn database_config(&self) -> DatabaseConfig {
            self.config.clone()
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }

        pub fn task_store(&self) -> PgTaskStore {
            PgTaskStore::new(self.pool.clone())
        }
    }
}
