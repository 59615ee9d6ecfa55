//! mysql-pg-migrate CLI - resumable MySQL to PostgreSQL data transfer.

use clap::{Parser, Subcommand, ValueEnum};
use mysql_pg_migrate::logging::DEFAULT_ERROR_LOG;
use mysql_pg_migrate::{Config, ErrorLog, MigrateError, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Parser)]
#[command(name = "mysql-pg-migrate")]
#[command(about = "Resumable MySQL to PostgreSQL data migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    verbosity: Verbosity,

    /// File that collects every error reported during the run
    #[arg(long, default_value = DEFAULT_ERROR_LOG)]
    error_log: PathBuf,

    /// Also append every log line to this file
    #[arg(long)]
    full_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Verbosity {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Verbosity> for Level {
    fn from(v: Verbosity) -> Self {
        match v {
            Verbosity::Debug => Level::DEBUG,
            Verbosity::Info => Level::INFO,
            Verbosity::Warn => Level::WARN,
            Verbosity::Error => Level::ERROR,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a migration
    Run {
        /// Override target schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Override number of concurrent worker pairs
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: list the tables that would be queued without transferring data
        #[arg(long)]
        dry_run: bool,
    },

    /// Test database connections
    HealthCheck,

    /// Drop the work queue and phase table left by an interrupted run
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Commands::Run {
        target_schema,
        workers,
        ..
    } = &cli.command
    {
        if let Some(schema) = target_schema {
            config.target.schema = schema.clone();
        }
        if let Some(w) = workers {
            config.migration.workers = Some(*w);
        }
        config.validate()?;
    }

    let log = setup_logging(&cli).await?;

    // Fill unset pool and buffer sizes from the detected hardware
    let config = config.with_auto_tuning();
    log.config(config.redacted_summary());
    info!("Loaded configuration from {:?}", cli.config);

    let outcome = execute(cli.command, config, cli.output_json).await;
    if let Err(ref e) = outcome {
        error!("{}", e);
    }

    log.close().await?;
    outcome
}

async fn execute(command: Commands, config: Config, output_json: bool) -> Result<(), MigrateError> {
    match command {
        Commands::Run { dry_run: true, .. } => {
            let orchestrator = Orchestrator::new(config).await?;
            let tasks = orchestrator.plan().await?;

            if output_json {
                let tables: Vec<_> = tasks
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "table": t.table_name,
                            "source_table": t.source_table(),
                            "row_count_estimate": t.row_count_estimate,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&tables)?);
            } else {
                println!("\nDry run completed!");
                println!("  Tables to transfer: {}", tasks.len());
                for task in &tasks {
                    println!("    {} (~{} rows)", task.table_name, task.row_count_estimate);
                }
            }
        }

        Commands::Run { .. } => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.run().await?;

            if output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nMigration completed!");
                println!("  Run ID: {}", result.run_id);
                println!("  Status: {}", result.status);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Tables: {}/{}", result.tables_success, result.tables_total);
                println!("  Rows: {}", result.rows_transferred);
                println!("  Rows copied: {}", result.rows_copied);
                println!("  Throughput: {} rows/sec", result.rows_per_second);
                println!("  Workers: {}", result.workers);
                if !result.failed_tables.is_empty() {
                    println!("  Failed tables: {:?}", result.failed_tables);
                }
                if !result.constraint_failures.is_empty() {
                    println!("  Constraint failures: {:?}", result.constraint_failures);
                }
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MySQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }

        Commands::Reset => {
            let orchestrator = Orchestrator::new(config).await?;
            orchestrator.reset().await?;
            println!("Migration state reset");
        }
    }

    Ok(())
}

/// Install console output plus the error log collector.
async fn setup_logging(cli: &Cli) -> Result<ErrorLog, MigrateError> {
    let level = Level::from(cli.verbosity);

    let log = ErrorLog::open(&cli.error_log, cli.full_log.as_deref()).await?;

    // Console goes to stderr so --output-json stays parseable
    let console = match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(console)
        .with(log.layer())
        .try_init()
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    Ok(log)
}
