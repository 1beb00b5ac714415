use crate::config::ConfigError;
use crate::db::{DbError, PoolError};
use crate::import::{ImportError, SplitError};
use crate::tasks::TaskStoreError;
use thiserror::Error;

/// Errors surfaced by a whole migration run.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("table creation failed: {0}")]
    Ddl(String),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error("task store error: {0}")]
    TaskStore(#[from] TaskStoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
