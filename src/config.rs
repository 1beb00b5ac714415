use crate::db::pool::PoolOptions;
use crate::dialect::{Dialect, DialectError};
use crate::import::ImportSettings;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(transparent)]
    Dialect(#[from] DialectError),
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Connection settings for the destination database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub dialect: Dialect,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DatabaseConfig {
    /// Defaults for a dialect: local host, the dialect's usual port and admin user.
    pub fn for_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            host: "localhost".to_string(),
            port: dialect.default_port(),
            user: dialect.default_user().to_string(),
            password: String::new(),
            database: "migration_db".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let dialect: Dialect = env_string("MIGRATOR_TARGET", "doris").parse()?;
        Ok(Self::from_env_for(dialect))
    }

    /// Like [`from_env`](Self::from_env) with the target fixed; port and user
    /// fall back to that target's defaults.
    pub fn from_env_for(dialect: Dialect) -> Self {
        let defaults = Self::for_dialect(dialect);

        let port = env::var("MIGRATOR_DB_PORT")
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .unwrap_or(defaults.port);

        Self {
            dialect,
            host: env_string("MIGRATOR_DB_HOST", &defaults.host),
            port,
            user: env_string("MIGRATOR_DB_USER", &defaults.user),
            password: env_string("MIGRATOR_DB_PASSWORD", ""),
            database: env_string("MIGRATOR_DB_NAME", &defaults.database),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Empty { key: "host" });
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::Empty { key: "user" });
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Empty { key: "database" });
        }
        if self.port == 0 {
            return Err(ConfigError::Zero { key: "port" });
        }
        Ok(())
    }
}

/// Tuning for the split/load pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Concurrent chunk workers; also the connection pool's size.
    pub max_workers: usize,
    pub chunk_size_mb: u64,
    pub retry_count: u32,
    pub temp_dir: PathBuf,
    pub acquire_timeout: Duration,
    pub backoff_base: Duration,
    /// Source schema names erased from statements and DDL.
    pub source_schemas: Vec<String>,
    pub task_database_url: Option<String>,
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        Self {
            max_workers: env_usize("MIGRATOR_MAX_WORKERS", 8),
            chunk_size_mb: env_u64("MIGRATOR_CHUNK_SIZE_MB", 30),
            retry_count: env_u64("MIGRATOR_RETRY_COUNT", 3).min(u32::MAX as u64) as u32,
            temp_dir: PathBuf::from(env_string("MIGRATOR_TEMP_DIR", "./temp")),
            acquire_timeout: env_duration_millis("MIGRATOR_ACQUIRE_TIMEOUT_MS", 30_000),
            backoff_base: env_duration_millis("MIGRATOR_BACKOFF_BASE_MS", 1_000),
            source_schemas: env_list("MIGRATOR_SOURCE_SCHEMAS"),
            task_database_url: env::var("MIGRATOR_TASK_DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Zero { key: "max_workers" });
        }
        if self.chunk_size_mb == 0 {
            return Err(ConfigError::Zero { key: "chunk_size_mb" });
        }
        Ok(())
    }

    pub fn max_chunk_bytes(&self) -> u64 {
        self.chunk_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_size: self.max_workers,
            acquire_timeout: self.acquire_timeout,
            ..PoolOptions::default()
        }
    }

    pub fn import_settings(&self) -> ImportSettings {
        ImportSettings {
            max_chunk_bytes: self.max_chunk_bytes(),
            pool_size: self.max_workers,
            retry_count: self.retry_count,
            temp_dir: self.temp_dir.clone(),
            backoff_base: self.backoff_base,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_defaults() {
        let doris = DatabaseConfig::for_dialect(Dialect::Doris);
        assert_eq!(doris.port, 9030);
        assert_eq!(doris.user, "root");

        let postgres = DatabaseConfig::for_dialect(Dialect::Postgres);
        assert_eq!(postgres.port, 5432);
        assert_eq!(postgres.user, "postgres");
        assert_eq!(postgres.database, "migration_db");
    }

    #[test]
    fn test_database_config_validation() {
        let mut config = DatabaseConfig::for_dialect(Dialect::Postgres);
        assert!(config.validate().is_ok());

        config.host = " ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::Empty { key: "host" }));

        config.host = "db".to_string();
        config.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero { key: "port" }));
    }

    #[test]
    fn test_migration_settings_derivation() {
        let config = MigrationConfig {
            max_workers: 4,
            chunk_size_mb: 2,
            retry_count: 5,
            temp_dir: PathBuf::from("/tmp/chunks"),
            acquire_timeout: Duration::from_secs(3),
            backoff_base: Duration::from_millis(10),
            source_schemas: vec!["EMR_HIS".to_string()],
            task_database_url: None,
        };

        assert!(config.validate().is_ok());
        assert_eq!(config.max_chunk_bytes(), 2 * 1024 * 1024);

        let pool = config.pool_options();
        assert_eq!(pool.max_size, 4);
        assert_eq!(pool.acquire_timeout, Duration::from_secs(3));

        let settings = config.import_settings();
        assert_eq!(settings.pool_size, 4);
        assert_eq!(settings.retry_count, 5);
        assert_eq!(settings.temp_dir, PathBuf::from("/tmp/chunks"));

        let invalid = MigrationConfig {
            max_workers: 0,
            ..config
        };
        assert_eq!(
            invalid.validate(),
            Err(ConfigError::Zero { key: "max_workers" })
        );
    }
}
