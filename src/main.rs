use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dump_migrator::db::{ConnectionPool, DatabaseConnection, DialectConnector};
use dump_migrator::import::FileSplitter;
use dump_migrator::tasks::{MemoryTaskStore, PgTaskStore, TaskStore};
use dump_migrator::{
    DatabaseConfig, Dialect, MigrationConfig, MigrationError, MigrationReport, MigrationRequest,
    Migrator,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "dump-migrator",
    about = "Load Oracle SQL dumps into Apache Doris or PostgreSQL"
)]
struct Cli {
    /// Destination database (`doris` or `postgresql`); overrides MIGRATOR_TARGET.
    #[arg(long, global = true)]
    target: Option<Dialect>,

    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(long, global = true)]
    password: Option<String>,

    #[arg(long, global = true)]
    database: Option<String>,

    /// Concurrent chunk loads and connection pool size.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Chunk size limit in MiB.
    #[arg(long, global = true)]
    chunk_size_mb: Option<u64>,

    /// Passes allowed per import.
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Root directory for chunk files.
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one dump file, optionally creating the table first.
    Import {
        #[arg(long)]
        file: PathBuf,

        /// Destination table; defaults to the dump file's stem.
        #[arg(long)]
        table: Option<String>,

        /// File holding the `CREATE TABLE` statement for the destination.
        #[arg(long)]
        ddl_file: Option<PathBuf>,

        /// Drop an existing table before running the DDL.
        #[arg(long)]
        drop_existing: bool,

        /// Print the final report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the destination database if needed, connect and report pool status.
    Check,
    /// Split a dump into chunk files without importing them.
    Split {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        table: String,

        #[arg(long)]
        out: PathBuf,
    },
    /// List migration tasks from the persistent task store.
    Tasks,
}

impl Cli {
    fn database_config(&self) -> Result<DatabaseConfig, MigrationError> {
        let mut config = match self.target {
            Some(dialect) => DatabaseConfig::from_env_for(dialect),
            None => DatabaseConfig::from_env()?,
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn migration_config(&self) -> Result<MigrationConfig, MigrationError> {
        let mut config = MigrationConfig::from_env();
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(chunk_size_mb) = self.chunk_size_mb {
            config.chunk_size_mb = chunk_size_mb;
        }
        if let Some(retries) = self.retries {
            config.retry_count = retries;
        }
        if let Some(temp_dir) = &self.temp_dir {
            config.temp_dir = temp_dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    dump_migrator::init_logger();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            let _ = writeln!(io::stderr(), "error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool, MigrationError> {
    let config = cli.migration_config()?;
    match &cli.command {
        Command::Import {
            file,
            table,
            ddl_file,
            drop_existing,
            json,
        } => {
            let table_name = match table {
                Some(table) => table.clone(),
                None => table_from_file(file)?,
            };
            let ddl = match ddl_file {
                Some(path) => Some(tokio::fs::read_to_string(path).await?),
                None => None,
            };
            let request = MigrationRequest {
                table_name,
                source_file: file.clone(),
                ddl,
                drop_existing: *drop_existing,
            };

            let database = cli.database_config()?;
            match config.task_database_url.clone() {
                Some(url) => {
                    let store = PgTaskStore::connect(&url).await?;
                    import(database, config, store, request, *json).await
                }
                None => import(database, config, MemoryTaskStore::new(), request, *json).await,
            }
        }
        Command::Check => {
            let database = cli.database_config()?;
            log::info!(
                "checking {} at {}:{}/{}",
                database.dialect,
                database.host,
                database.port,
                database.database
            );
            let connector = DialectConnector::new(database);
            connector.ensure_database().await?;
            let pool = ConnectionPool::new(connector, config.pool_options()).await?;
            let mut conn = pool.acquire().await?;
            conn.ping().await?;
            drop(conn);
            println!("{:?}", pool.status());
            pool.dispose_all().await;
            Ok(true)
        }
        Command::Split { file, table, out } => {
            let splitter = FileSplitter::new(&config.temp_dir, config.max_chunk_bytes());
            let (file, table, out) = (file.clone(), table.clone(), out.clone());
            let written = tokio::task::spawn_blocking(move || -> Result<_, MigrationError> {
                let chunks = splitter.split(&file, &table)?;
                let written = chunks.persist_into(&out)?;
                chunks.cleanup()?;
                Ok(written)
            })
            .await??;
            for path in &written {
                println!("{}", path.display());
            }
            log::info!("wrote {} chunk files", written.len());
            Ok(true)
        }
        Command::Tasks => {
            let Some(url) = config.task_database_url.as_deref() else {
                let _ = writeln!(
                    io::stderr(),
                    "error: MIGRATOR_TASK_DATABASE_URL is not set; no persistent task store"
                );
                return Ok(false);
            };
            let store = PgTaskStore::connect(url).await?;
            for task in store.list().await? {
                println!(
                    "{}  {:<15} {:<30} {:>6.1}%  rows={}  attempts={}  {}",
                    task.id,
                    task.status.as_str(),
                    task.table_name,
                    task.progress_percent,
                    task.rows_imported,
                    task.attempts,
                    task.error_message.as_deref().unwrap_or("")
                );
            }
            Ok(true)
        }
    }
}

async fn import<S: TaskStore>(
    database: DatabaseConfig,
    config: MigrationConfig,
    store: S,
    request: MigrationRequest,
    json: bool,
) -> Result<bool, MigrationError> {
    let connector = DialectConnector::new(database);
    connector.ensure_database().await?;
    let pool = ConnectionPool::new(connector, config.pool_options()).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received; stopping after the current pass");
                cancel.cancel();
            }
        });
    }

    let migrator = Migrator::new(pool.clone(), Arc::new(store), config).with_cancellation(cancel);
    let outcome = migrator.run(request).await;
    pool.dispose_all().await;

    let report = outcome?;
    print_report(&report, json);
    Ok(report.success())
}

fn print_report(report: &MigrationReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(text) => println!("{text}"),
            Err(err) => log::error!("failed to serialize report: {}", err),
        }
        return;
    }

    let task = &report.task;
    println!("task:     {}", task.id);
    println!("table:    {}", task.table_name);
    println!("status:   {}", task.status.as_str());
    if let Some(ddl) = &report.ddl {
        println!("ddl:      {}", ddl.message);
    }
    if let Some(result) = &report.result {
        println!(
            "chunks:   {} total, {} completed, {} failed",
            result.total_chunks, result.completed_chunks, result.failed_chunks
        );
        println!("rows:     {}", result.total_rows_imported);
        println!("attempts: {}", result.attempts);
        println!("elapsed:  {:.2?}", result.total_elapsed);
    }
    if let Some(error) = &task.error_message {
        println!("error:    {error}");
    }
}

fn table_from_file(file: &Path) -> Result<String, MigrationError> {
    file.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            MigrationError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot derive a table name from {}", file.display()),
            ))
        })
}
