//! # mysql-pg-migrate
//!
//! Resumable, concurrent MySQL to PostgreSQL data transfer engine.
//!
//! The library moves table data from a MySQL source into a PostgreSQL
//! destination with:
//!
//! - **Text COPY loads** fed by a byte pipe from a streaming reader
//! - **Parallel worker pairs** bounded by CPUs, pool size and pending work
//! - **Resume capability** via a work queue and phase flags kept in the
//!   destination itself
//! - **Early constraint loading** for each table as soon as its data lands
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_pg_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> mysql_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run().await?;
//!     println!("Migrated {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod state;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use self::core::{Batch, Column, SchemaHooks, SourceReader, SqlValue, Table, TargetPool, TargetSession};
pub use drivers::{MysqlReader, PgSession, PgTarget};
pub use error::{MigrateError, Result};
pub use logging::{ErrorLog, ErrorLogLayer, LogMessage};
pub use orchestrator::{
    HealthCheckResult, LoadSummary, MigrationResult, NoOpSchemaHooks, Orchestrator, PipeManager,
    SchedulerState,
};
pub use pipeline::{DataTask, TaskPlanner};
pub use queue::{QueueTable, WorkQueue};
pub use state::{Phase, PhaseState, PhaseTable};
pub use transfer::{TaskFailure, TransferSettings};
