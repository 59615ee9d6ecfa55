//! Migration orchestrator - main workflow coordinator.
//!
//! Runs the four phases recorded in the phase table, skipping any a previous
//! run already finished:
//!
//! 1. structure: extract, filter, create tables, plan and enqueue tasks
//! 2. data: scheduler plus per-table constraints as each table finishes
//! 3. foreign keys
//! 4. views

mod hooks;
mod scheduler;

pub use hooks::NoOpSchemaHooks;
pub use scheduler::{concurrency_width, LoadSummary, PipeManager, SchedulerState};

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{Config, SystemResources};
use crate::core::traits::{SchemaHooks, SourceReader, TargetPool, TargetSession};
use crate::drivers::{MysqlReader, PgTarget};
use crate::error::Result;
use crate::pipeline::{DataTask, TaskPlanner};
use crate::queue::{QueueTable, WorkQueue};
use crate::state::{Phase, PhaseState, PhaseTable};
use crate::transfer::{TaskFailure, TransferSettings};

/// Migration orchestrator.
pub struct Orchestrator<S: SourceReader, P: TargetPool, H: SchemaHooks> {
    config: Config,
    source: Arc<S>,
    target: Arc<P>,
    hooks: Arc<H>,
    queue: Arc<WorkQueue<P>>,
    phases: PhaseState<P>,
    cpu_cores: usize,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// `accomplished` when every table loaded, `partial` otherwise.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Tables loaded by this run.
    pub tables_total: usize,

    pub tables_success: usize,

    pub tables_failed: usize,

    /// Sum of reported row counts.
    pub rows_transferred: i64,

    /// Rows acknowledged by the destination.
    pub rows_copied: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: i64,

    /// Concurrent worker pairs used.
    pub workers: usize,

    pub failed_tables: Vec<String>,

    /// Tables whose per-table constraints failed.
    pub constraint_failures: Vec<String>,

    /// Details of each failed task.
    pub failures: Vec<TaskFailure>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity of both databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

impl Orchestrator<MysqlReader, PgTarget, NoOpSchemaHooks> {
    /// Connect to MySQL and PostgreSQL using the configuration.
    pub async fn new(config: Config) -> Result<Self> {
        let resources = SystemResources::detect();
        let migration = &config.migration;

        let source = MysqlReader::new(
            &config.source,
            migration.get_max_mysql_connections(),
            migration.mysql_charset().unwrap_or("utf8mb4"),
        )
        .await?;
        let target = PgTarget::new(&config.target, migration.get_max_pg_connections()).await?;

        Ok(Self::with_parts(
            config,
            source,
            target,
            NoOpSchemaHooks::new(),
            resources.cpu_cores,
        ))
    }
}

impl<S: SourceReader, P: TargetPool, H: SchemaHooks> Orchestrator<S, P, H> {
    /// Assemble an orchestrator from already-connected parts.
    pub fn with_parts(config: Config, source: S, target: P, hooks: H, cpu_cores: usize) -> Self {
        let target = Arc::new(target);
        let schema = &config.target.schema;
        let database = &config.source.database;
        let queue = Arc::new(WorkQueue::new(
            target.clone(),
            QueueTable::new(schema, database),
        ));
        let phases = PhaseState::new(target.clone(), PhaseTable::new(schema, database));

        Self {
            config,
            source: Arc::new(source),
            target,
            hooks: Arc::new(hooks),
            queue,
            phases,
            cpu_cores,
        }
    }

    /// Replace the DDL hooks.
    pub fn with_hooks<H2: SchemaHooks>(self, hooks: H2) -> Orchestrator<S, P, H2> {
        Orchestrator {
            config: self.config,
            source: self.source,
            target: self.target,
            hooks: Arc::new(hooks),
            queue: self.queue,
            phases: self.phases,
            cpu_cores: self.cpu_cores,
        }
    }

    /// Run the migration, resuming from the recorded phase flags.
    pub async fn run(&self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting migration run: {}", run_id);

        self.phases.create_if_absent().await?;
        self.queue.create().await?;

        if self.phases.get(Phase::TablesLoaded).await? {
            info!("Phase 1: table structure already loaded, resuming");
        } else {
            info!("Phase 1: Loading table structure");
            let tasks = self.plan_tasks(true).await?;
            self.queue.clear().await?;
            for task in &tasks {
                self.queue.enqueue(task).await?;
            }
            info!("Queued {} tables", tasks.len());
            self.phases.set_many(&[Phase::TablesLoaded]).await?;
        }

        let mut summary = LoadSummary::default();
        let mut constraint_failures = Vec::new();
        if self.phases.get(Phase::PerTableConstraintsLoaded).await? {
            info!("Phase 2: data already loaded, resuming");
        } else {
            info!("Phase 2: Loading data");
            let pool = self.queue.load_all().await?;
            let (finished_tx, finished_rx) = mpsc::unbounded_channel();
            let constraints = tokio::spawn(load_constraints(self.hooks.clone(), finished_rx));

            let mut manager = PipeManager::new(
                self.source.clone(),
                self.target.clone(),
                self.queue.clone(),
                Arc::new(TransferSettings::from_config(&self.config)),
                self.cpu_cores,
                self.config.migration.workers,
            );
            summary = manager.run(pool, finished_tx).await;

            constraint_failures = match constraints.await {
                Ok(failed) => failed,
                Err(e) => {
                    error!("Constraint loader stopped: {}", e);
                    Vec::new()
                }
            };
            self.phases
                .set_many(&[Phase::PerTableConstraintsLoaded])
                .await?;
        }

        if self.phases.get(Phase::ForeignKeysLoaded).await? {
            info!("Phase 3: foreign keys already created");
        } else {
            info!("Phase 3: Creating foreign keys");
            self.hooks.create_foreign_keys().await?;
            self.phases.set_many(&[Phase::ForeignKeysLoaded]).await?;
        }

        if self.phases.get(Phase::ViewsLoaded).await? {
            info!("Phase 4: views already created");
        } else {
            info!("Phase 4: Creating views");
            self.hooks.create_views().await?;
            self.phases.set_many(&[Phase::ViewsLoaded]).await?;
        }

        self.queue.drop_queue().await;
        self.phases.drop().await;

        let completed_at = Utc::now();
        let result = build_result(run_id, started_at, completed_at, summary, constraint_failures);
        info!(
            "Migration {}: {} tables, {} rows in {:.1}s ({} rows/s)",
            result.status,
            result.tables_total,
            result.rows_transferred,
            result.duration_seconds,
            result.rows_per_second
        );
        Ok(result)
    }

    /// Tasks a fresh run would queue, without touching the destination.
    pub async fn plan(&self) -> Result<Vec<DataTask>> {
        self.plan_tasks(false).await
    }

    async fn plan_tasks(&self, create_tables: bool) -> Result<Vec<DataTask>> {
        let database = &self.config.source.database;
        let tables = self.source.extract_tables(database).await?;
        info!("Found {} tables in {}", tables.len(), database);

        let planner = TaskPlanner::from_config(&self.config.migration);
        let tables = planner.filter_tables(tables);
        if create_tables {
            self.hooks.create_tables(&tables).await?;
        }
        planner.plan(&tables)
    }

    /// Round-trip both databases.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let started = Instant::now();
        let source = self.source.test_connection().await;
        let source_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let target = match self.target.session().await {
            Ok(mut session) => session.ping().await,
            Err(e) => Err(e),
        };
        let target_latency_ms = started.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.as_ref().err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.as_ref().err().map(|e| e.to_string()),
            healthy: source.is_ok() && target.is_ok(),
        })
    }

    /// Drop the work queue and phase table so the next run starts fresh.
    pub async fn reset(&self) -> Result<()> {
        info!(
            "Resetting migration state: {}, {}",
            self.queue.table().name(),
            self.phases.table().name()
        );
        self.queue.drop_queue().await;
        self.phases.drop().await;
        Ok(())
    }
}

/// Start per-table constraint work for each finished table while loading
/// continues. Resolves once the notification channel closes and every
/// started job has ended; returns the tables whose constraints failed.
async fn load_constraints<H: SchemaHooks>(
    hooks: Arc<H>,
    mut finished: mpsc::UnboundedReceiver<String>,
) -> Vec<String> {
    let mut running = JoinSet::new();
    while let Some(table) = finished.recv().await {
        let hooks = hooks.clone();
        running.spawn(async move {
            let result = hooks.load_table_constraints(&table).await;
            (table, result)
        });
    }

    let mut failed = Vec::new();
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((table, Err(e))) => {
                error!("{}: failed to load constraints: {}", table, e);
                failed.push(table);
            }
            Err(e) => error!("Constraint job stopped: {}", e),
        }
    }
    failed.sort();
    failed
}

fn build_result(
    run_id: String,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    summary: LoadSummary,
    constraint_failures: Vec<String>,
) -> MigrationResult {
    let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

    let mut failed_tables: Vec<String> = summary.failures.iter().map(|f| f.table.clone()).collect();
    failed_tables.sort();
    failed_tables.dedup();

    let rows_per_second = if duration > 0.0 {
        (summary.rows_reported as f64 / duration) as i64
    } else {
        0
    };

    let status = if failed_tables.is_empty() && constraint_failures.is_empty() {
        "accomplished"
    } else {
        "partial"
    };

    MigrationResult {
        run_id,
        status: status.to_string(),
        duration_seconds: duration,
        started_at,
        completed_at,
        tables_total: summary.tables_completed,
        tables_success: summary.tables_completed.saturating_sub(failed_tables.len()),
        tables_failed: failed_tables.len(),
        rows_transferred: summary.rows_reported,
        rows_copied: summary.rows_copied,
        rows_per_second,
        workers: summary.width,
        failed_tables,
        constraint_failures,
        failures: summary.failures,
    }
}
