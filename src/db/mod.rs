//! Destination database access.
//!
//! Both targets are driven through one capability set ([`DatabaseConnection`]).
//! Doris is reached through its MySQL-compatible frontend, PostgreSQL through
//! its native protocol. Statements coming from dump files are executed
//! unprepared so the servers parse them as plain text.

pub mod pool;

use crate::config::DatabaseConfig;
use crate::dialect::{Dialect, DialectError, validate_identifier};
use log::LevelFilter;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use pool::{ConnectionPool, PoolError, PoolOptions, PoolStatus, PooledConnection};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POSTGRES_MAINTENANCE_DATABASE: &str = "postgres";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Dialect(#[from] DialectError),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("{0}")]
    Execution(String),
}

impl DbError {
    /// Whether the session behind this error is unusable and must not be reused.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            DbError::ConnectionLost(_) | DbError::ConnectTimeout(_) => true,
            DbError::Sqlx(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// One live session against the destination database.
pub trait DatabaseConnection: Send + 'static {
    fn dialect(&self) -> Dialect;

    /// Lightweight round trip used to probe liveness.
    fn ping(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Run `statements` in order inside one transaction and commit once.
    /// Returns the summed rows affected; on error nothing is committed.
    fn execute_batch(
        &mut self,
        statements: &[String],
    ) -> impl Future<Output = Result<u64, DbError>> + Send;

    fn execute_ddl(&mut self, ddl: &str) -> impl Future<Output = Result<(), DbError>> + Send;

    fn table_exists(&mut self, table: &str) -> impl Future<Output = Result<bool, DbError>> + Send;

    fn drop_table(&mut self, table: &str) -> impl Future<Output = Result<(), DbError>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Produces new sessions for a [`ConnectionPool`].
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: DatabaseConnection;

    fn dialect(&self) -> Dialect;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, DbError>> + Send;
}

/// A sqlx session for either supported target.
#[derive(Debug)]
pub enum DialectConnection {
    Doris(MySqlConnection),
    Postgres(PgConnection),
}

impl DatabaseConnection for DialectConnection {
    fn dialect(&self) -> Dialect {
        match self {
            DialectConnection::Doris(_) => Dialect::Doris,
            DialectConnection::Postgres(_) => Dialect::Postgres,
        }
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        match self {
            DialectConnection::Doris(conn) => conn.ping().await?,
            DialectConnection::Postgres(conn) => conn.ping().await?,
        }
        Ok(())
    }

    async fn execute_batch(&mut self, statements: &[String]) -> Result<u64, DbError> {
        let mut affected = 0u64;
        match self {
            DialectConnection::Doris(conn) => {
                let mut tx = conn.begin().await?;
                for statement in statements {
                    match Executor::execute(&mut *tx, statement.as_str()).await {
                        Ok(result) => affected += result.rows_affected(),
                        Err(err) => {
                            if let Err(rollback_err) = tx.rollback().await {
                                log::debug!("rollback failed: {}", rollback_err);
                            }
                            return Err(err.into());
                        }
                    }
                }
                tx.commit().await?;
            }
            DialectConnection::Postgres(conn) => {
                let mut tx = conn.begin().await?;
                for statement in statements {
                    match Executor::execute(&mut *tx, statement.as_str()).await {
                        Ok(result) => affected += result.rows_affected(),
                        Err(err) => {
                            if let Err(rollback_err) = tx.rollback().await {
                                log::debug!("rollback failed: {}", rollback_err);
                            }
                            return Err(err.into());
                        }
                    }
                }
                tx.commit().await?;
            }
        }
        Ok(affected)
    }

    async fn execute_ddl(&mut self, ddl: &str) -> Result<(), DbError> {
        let ddl = ddl.trim().trim_end_matches(';');
        match self {
            DialectConnection::Doris(conn) => {
                Executor::execute(&mut *conn, ddl).await?;
            }
            DialectConnection::Postgres(conn) => {
                Executor::execute(&mut *conn, ddl).await?;
            }
        }
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        let table = validate_identifier(table)?;
        match self {
            DialectConnection::Doris(conn) => {
                let sql = format!(
                    "SELECT COUNT(*) FROM information_schema.tables \
                     WHERE table_schema = DATABASE() AND table_name = '{}'",
                    table
                );
                let row = Executor::fetch_one(&mut *conn, sql.as_str()).await?;
                let count: i64 = row.try_get(0)?;
                Ok(count > 0)
            }
            DialectConnection::Postgres(conn) => {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_name = $1)",
                )
                .bind(table.to_lowercase())
                .fetch_one(&mut *conn)
                .await?;
                Ok(exists)
            }
        }
    }

    async fn drop_table(&mut self, table: &str) -> Result<(), DbError> {
        let sql = format!("DROP TABLE IF EXISTS {}", validate_identifier(table)?);
        self.execute_ddl(&sql).await
    }

    async fn close(self) {
        let result = match self {
            DialectConnection::Doris(conn) => conn.close().await,
            DialectConnection::Postgres(conn) => conn.close().await,
        };
        if let Err(err) = result {
            log::debug!("error closing connection: {}", err);
        }
    }
}

/// Opens [`DialectConnection`]s for the configured target.
#[derive(Debug, Clone)]
pub struct DialectConnector {
    config: DatabaseConfig,
}

impl DialectConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Open a session on `database`, or on the server's default database when
    /// `None`.
    async fn open(&self, database: Option<&str>) -> Result<DialectConnection, DbError> {
        let config = &self.config;
        match config.dialect {
            Dialect::Doris => {
                let mut options = MySqlConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .username(&config.user)
                    .password(&config.password)
                    .pipes_as_concat(false)
                    .no_engine_subsitution(false)
                    .log_statements(LevelFilter::Trace);
                if let Some(database) = database {
                    options = options.database(database);
                }
                Ok(DialectConnection::Doris(options.connect().await?))
            }
            Dialect::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .username(&config.user)
                    .password(&config.password)
                    .database(database.unwrap_or(POSTGRES_MAINTENANCE_DATABASE))
                    .log_statements(LevelFilter::Trace);
                Ok(DialectConnection::Postgres(options.connect().await?))
            }
        }
    }

    async fn open_with_timeout(&self, database: Option<&str>) -> Result<DialectConnection, DbError> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.open(database)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::ConnectTimeout(CONNECT_TIMEOUT)),
        }
    }

    /// Create the configured database when the server does not have it yet.
    /// Returns whether it was created.
    ///
    /// The check runs on a session without a database (Doris) or on the
    /// `postgres` maintenance database, so it works before the target exists.
    pub async fn ensure_database(&self) -> Result<bool, DbError> {
        let name = validate_identifier(&self.config.database)?;
        let mut conn = self.open_with_timeout(None).await?;
        let result = create_database_if_missing(&mut conn, name).await;
        conn.close().await;

        let created = result?;
        if created {
            log::info!("created {} database {}", self.config.dialect, name);
        } else {
            log::debug!("{} database {} already exists", self.config.dialect, name);
        }
        Ok(created)
    }
}

async fn create_database_if_missing(conn: &mut DialectConnection, name: &str) -> Result<bool, DbError> {
    match conn {
        DialectConnection::Doris(conn) => {
            let sql = format!(
                "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = '{}'",
                name
            );
            let row = Executor::fetch_one(&mut *conn, sql.as_str()).await?;
            let count: i64 = row.try_get(0)?;
            if count > 0 {
                return Ok(false);
            }
            let sql = format!("CREATE DATABASE IF NOT EXISTS {}", name);
            Executor::execute(&mut *conn, sql.as_str()).await?;
            Ok(true)
        }
        DialectConnection::Postgres(conn) => {
            // Unquoted identifiers fold to lower case.
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                    .bind(name.to_lowercase())
                    .fetch_one(&mut *conn)
                    .await?;
            if exists {
                return Ok(false);
            }
            let sql = format!("CREATE DATABASE {}", name);
            Executor::execute(&mut *conn, sql.as_str()).await?;
            Ok(true)
        }
    }
}

impl ConnectionFactory for DialectConnector {
    type Connection = DialectConnection;

    fn dialect(&self) -> Dialect {
        self.config.dialect
    }

    async fn connect(&self) -> Result<DialectConnection, DbError> {
        log::debug!(
            "connecting to {} at {}:{}/{}",
            self.config.dialect,
            self.config.host,
            self.config.port,
            self.config.database
        );
        self.open_with_timeout(Some(&self.config.database)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_database_rejects_unsafe_name() {
        let connector = DialectConnector::new(DatabaseConfig {
            database: "emr; DROP DATABASE x".to_string(),
            ..DatabaseConfig::for_dialect(Dialect::Doris)
        });
        let err = connector.ensure_database().await.err();
        assert!(matches!(err, Some(DbError::Dialect(_))));
    }

    #[test]
    fn test_connection_lost_classification() {
        let io = DbError::Sqlx(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(io.is_connection_lost());
        assert!(DbError::ConnectTimeout(CONNECT_TIMEOUT).is_connection_lost());
        assert!(!DbError::Execution("syntax error".to_string()).is_connection_lost());
        assert!(!DbError::Sqlx(sqlx::Error::RowNotFound).is_connection_lost());
    }
}
