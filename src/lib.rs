//! Parallel import of Oracle SQL dumps into Apache Doris or PostgreSQL.
//!
//! A dump is split into chunk files, each chunk is cleaned into executable
//! `INSERT` statements and loaded in its own transaction on a pooled
//! connection, and failed passes are retried as a whole. See [`import`] for
//! the pipeline and [`migrator`] for the task-tracking wrapper around it.

pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod import;
pub mod migrator;
pub mod tasks;

pub mod test_support;

pub use config::{DatabaseConfig, MigrationConfig};
pub use dialect::Dialect;
pub use error::MigrationError;
pub use migrator::{MigrationReport, MigrationRequest, Migrator};

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the process logger once; `RUST_LOG` overrides the default filter.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}
