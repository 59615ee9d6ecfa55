//! Traits at the seams between the transfer engine and the databases.
//!
//! - [`SourceReader`]: schema metadata and streamed rows from the source
//! - [`TargetPool`] / [`TargetSession`]: destination sessions that hold the
//!   work queue, the phase table and the bulk load
//! - [`SchemaHooks`]: DDL work that runs around data loading

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::schema::Table;
use crate::core::value::Batch;
use crate::error::Result;
use crate::queue::QueueTable;
use crate::state::{Phase, PhaseTable};

/// Reads schema metadata and row data from the source database.
#[async_trait]
pub trait SourceReader: Send + Sync + 'static {
    /// Extract base tables with their columns and row estimates.
    async fn extract_tables(&self, schema: &str) -> Result<Vec<Table>>;

    /// Run a read statement and stream its rows in batches.
    ///
    /// Rows are fetched incrementally; the channel is bounded so a slow
    /// consumer pauses the fetch. A failed query or row decode arrives as an
    /// `Err` item, after which the channel closes.
    fn stream_query(&self, sql: String, batch_size: usize) -> mpsc::Receiver<Result<Batch>>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Database type identifier.
    fn db_type(&self) -> &str;
}

/// A pool of destination sessions.
#[async_trait]
pub trait TargetPool: Send + Sync + 'static {
    type Session: TargetSession;

    /// Check out one session. It returns to the pool when dropped.
    async fn session(&self) -> Result<Self::Session>;

    /// Maximum number of sessions the pool hands out at once.
    fn max_size(&self) -> usize;
}

/// One destination session, held for the lifetime of the work that uses it.
///
/// Everything a worker pair does on the destination goes through the same
/// session, so queue deletion and trigger-mode restoration are ordered after
/// that pair's own bulk load.
#[async_trait]
pub trait TargetSession: Send + 'static {
    // ===== Work queue =====

    /// Create the queue table if it does not exist.
    async fn create_queue(&mut self, queue: &QueueTable) -> Result<()>;

    /// Insert one serialized task and return its id.
    async fn insert_task(&mut self, queue: &QueueTable, payload: &str) -> Result<i64>;

    /// All `(id, payload)` rows in insertion order.
    async fn load_tasks(&mut self, queue: &QueueTable) -> Result<Vec<(i64, String)>>;

    /// Delete one task and, when given, restore the trigger mode, as one batch.
    async fn finish_task(
        &mut self,
        queue: &QueueTable,
        id: i64,
        restore_trigger_mode: Option<&str>,
    ) -> Result<()>;

    /// Delete every task row.
    async fn clear_queue(&mut self, queue: &QueueTable) -> Result<()>;

    async fn drop_queue(&mut self, queue: &QueueTable) -> Result<()>;

    // ===== Phase state =====

    /// Create the phase table and its single all-false row if absent.
    async fn create_phase_table(&mut self, table: &PhaseTable) -> Result<()>;

    async fn read_phase(&mut self, table: &PhaseTable, phase: Phase) -> Result<bool>;

    /// Set every listed flag to true in one statement.
    async fn mark_phases(&mut self, table: &PhaseTable, phases: &[Phase]) -> Result<()>;

    async fn drop_phase_table(&mut self, table: &PhaseTable) -> Result<()>;

    // ===== Data transfer =====

    /// Whether the table holds at least one row (`SELECT 1 ... LIMIT 1`).
    async fn table_has_rows(&mut self, schema: &str, table: &str) -> Result<bool>;

    /// Current trigger mode of this session.
    async fn trigger_mode(&mut self) -> Result<String>;

    async fn set_trigger_mode(&mut self, mode: &str) -> Result<()>;

    /// Run a `COPY ... FROM STDIN` statement fed by `data`.
    ///
    /// An `Err` item from `data` aborts the copy and is returned; nothing from
    /// an aborted copy is committed.
    async fn copy_in(
        &mut self,
        statement: &str,
        data: mpsc::Receiver<Result<Bytes>>,
    ) -> Result<u64>;

    /// Round-trip a trivial query.
    async fn ping(&mut self) -> Result<()>;

    /// Close the session instead of returning it to the pool. Used when its
    /// settings could not be put back.
    fn discard(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// DDL collaborator invoked by the orchestrator around data loading.
#[async_trait]
pub trait SchemaHooks: Send + Sync + 'static {
    /// Create destination tables before any task is planned.
    async fn create_tables(&self, tables: &[Table]) -> Result<()>;

    /// Per-table constraints (primary key, indexes, defaults, sequences).
    /// Called as soon as that table's data is loaded.
    async fn load_table_constraints(&self, table: &str) -> Result<()>;

    /// Foreign keys, after every table is loaded.
    async fn create_foreign_keys(&self) -> Result<()>;

    /// Views, after foreign keys.
    async fn create_views(&self) -> Result<()>;
}
