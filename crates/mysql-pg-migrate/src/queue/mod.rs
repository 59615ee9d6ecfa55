//! Persisted work queue ("data pool") of transfer tasks.
//!
//! One row per not-yet-finished task lives in a destination table
//! `(id BIGSERIAL, metadata TEXT)`. The scheduler reads the whole table once
//! at start; each worker pair deletes its own row when the task ends,
//! whether it succeeded or failed. An empty queue is dropped at the end of
//! a completed migration.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::identifier::{qualify_pg, truncate_pg};
use crate::core::traits::{TargetPool, TargetSession};
use crate::error::{MigrateError, Result};
use crate::pipeline::DataTask;

/// Name and SQL of the queue table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTable {
    schema: String,
    name: String,
}

impl QueueTable {
    /// Queue table for a source database, placed in the target schema.
    pub fn new(schema: &str, source_database: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: truncate_pg(&format!("data_pool_{}", source_database)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified(&self) -> Result<String> {
        qualify_pg(&self.schema, &self.name)
    }

    pub fn create_sql(&self) -> Result<String> {
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, metadata TEXT NOT NULL)",
            self.qualified()?
        ))
    }

    pub fn insert_sql(&self) -> Result<String> {
        Ok(format!(
            "INSERT INTO {} (metadata) VALUES ($1) RETURNING id",
            self.qualified()?
        ))
    }

    pub fn select_sql(&self) -> Result<String> {
        Ok(format!(
            "SELECT id, metadata FROM {} ORDER BY id",
            self.qualified()?
        ))
    }

    pub fn delete_sql(&self, id: i64) -> Result<String> {
        Ok(format!("DELETE FROM {} WHERE id = {}", self.qualified()?, id))
    }

    pub fn clear_sql(&self) -> Result<String> {
        Ok(format!("DELETE FROM {}", self.qualified()?))
    }

    pub fn drop_sql(&self) -> Result<String> {
        Ok(format!("DROP TABLE IF EXISTS {}", self.qualified()?))
    }
}

/// Work queue operations over a destination pool.
pub struct WorkQueue<P: TargetPool> {
    pool: Arc<P>,
    table: QueueTable,
}

impl<P: TargetPool> WorkQueue<P> {
    pub fn new(pool: Arc<P>, table: QueueTable) -> Self {
        Self { pool, table }
    }

    pub fn table(&self) -> &QueueTable {
        &self.table
    }

    /// Create the queue table if absent. Failure is fatal to the run.
    pub async fn create(&self) -> Result<()> {
        let mut session = self.pool.session().await?;
        session
            .create_queue(&self.table)
            .await
            .map_err(|e| MigrateError::Queue(format!("creating {}: {}", self.table.name, e)))?;
        debug!("Work queue {} ready", self.table.name);
        Ok(())
    }

    /// Remove every queued task.
    ///
    /// Planning starts from an empty queue so that tasks left by a run that
    /// stopped mid-enqueue are not queued twice.
    pub async fn clear(&self) -> Result<()> {
        let mut session = self.pool.session().await?;
        session
            .clear_queue(&self.table)
            .await
            .map_err(|e| MigrateError::Queue(format!("clearing {}: {}", self.table.name, e)))?;
        debug!("Cleared work queue {}", self.table.name);
        Ok(())
    }

    /// Persist one task and return its assigned id.
    pub async fn enqueue(&self, task: &DataTask) -> Result<i64> {
        let payload = task.to_payload()?;
        let mut session = self.pool.session().await?;
        let id = session
            .insert_task(&self.table, &payload)
            .await
            .map_err(|e| {
                MigrateError::Queue(format!("enqueueing {}: {}", task.table_name, e))
            })?;
        debug!("{}: enqueued as task {}", task.table_name, id);
        Ok(id)
    }

    /// Read every queued task into memory. Failure is fatal to the run.
    ///
    /// The returned vector is in insertion order and is consumed from the
    /// end, so the most recently enqueued task runs first.
    pub async fn load_all(&self) -> Result<Vec<DataTask>> {
        let mut session = self.pool.session().await?;
        let rows = session
            .load_tasks(&self.table)
            .await
            .map_err(|e| MigrateError::Queue(format!("reading {}: {}", self.table.name, e)))?;

        let tasks = rows
            .into_iter()
            .map(|(id, payload)| DataTask::from_payload(id, &payload))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| MigrateError::Queue(format!("decoding {}: {}", self.table.name, e)))?;

        info!("Loaded {} tasks from {}", tasks.len(), self.table.name);
        Ok(tasks)
    }

    /// Delete a task on the caller's held session, restoring the trigger mode
    /// in the same round trip when one was captured.
    pub async fn dequeue_delete(
        &self,
        session: &mut P::Session,
        id: i64,
        restore_trigger_mode: Option<&str>,
    ) -> Result<()> {
        session
            .finish_task(&self.table, id, restore_trigger_mode)
            .await
    }

    /// Drop the queue table. Failures are logged, never returned.
    pub async fn drop_queue(&self) {
        let result = match self.pool.session().await {
            Ok(mut session) => session.drop_queue(&self.table).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Dropped work queue {}", self.table.name),
            Err(e) => warn!("Failed to drop work queue {}: {}", self.table.name, e),
        }
    }
}
