//! Migration phase state persisted in the destination.
//!
//! A single row of four booleans records which whole phases a migration has
//! finished, so a restarted run can skip them. Flags only ever move from
//! false to true; the table is dropped when the migration completes.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::identifier::{qualify_pg, truncate_pg};
use crate::core::traits::{TargetPool, TargetSession};
use crate::error::{MigrateError, Result};

/// One phase flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    TablesLoaded,
    PerTableConstraintsLoaded,
    ForeignKeysLoaded,
    ViewsLoaded,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::TablesLoaded,
        Phase::PerTableConstraintsLoaded,
        Phase::ForeignKeysLoaded,
        Phase::ViewsLoaded,
    ];

    /// Column name in the phase table.
    pub fn column(&self) -> &'static str {
        match self {
            Phase::TablesLoaded => "tables_loaded",
            Phase::PerTableConstraintsLoaded => "per_table_constraints_loaded",
            Phase::ForeignKeysLoaded => "foreign_keys_loaded",
            Phase::ViewsLoaded => "views_loaded",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Name and SQL of the phase table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTable {
    schema: String,
    name: String,
}

impl PhaseTable {
    pub fn new(schema: &str, source_database: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: truncate_pg(&format!("state_logs_{}", source_database)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified(&self) -> Result<String> {
        qualify_pg(&self.schema, &self.name)
    }

    /// Create the table and seed its single row only when the table is empty.
    pub fn create_sql(&self) -> Result<String> {
        let table = self.qualified()?;
        let columns = Phase::ALL
            .iter()
            .map(|p| format!("{} BOOLEAN NOT NULL DEFAULT FALSE", p.column()))
            .collect::<Vec<_>>()
            .join(", ");
        let names = Phase::ALL
            .iter()
            .map(|p| p.column())
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns}); \
             INSERT INTO {table} ({names}) \
             SELECT FALSE, FALSE, FALSE, FALSE \
             WHERE NOT EXISTS (SELECT 1 FROM {table})"
        ))
    }

    pub fn select_sql(&self, phase: Phase) -> Result<String> {
        Ok(format!(
            "SELECT {} FROM {} LIMIT 1",
            phase.column(),
            self.qualified()?
        ))
    }

    /// One UPDATE that sets every listed flag.
    pub fn update_sql(&self, phases: &[Phase]) -> Result<String> {
        let sets = phases
            .iter()
            .map(|p| format!("{} = TRUE", p.column()))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("UPDATE {} SET {}", self.qualified()?, sets))
    }

    pub fn drop_sql(&self) -> Result<String> {
        Ok(format!("DROP TABLE IF EXISTS {}", self.qualified()?))
    }
}

/// Phase flag operations over a destination pool.
pub struct PhaseState<P: TargetPool> {
    pool: Arc<P>,
    table: PhaseTable,
}

impl<P: TargetPool> PhaseState<P> {
    pub fn new(pool: Arc<P>, table: PhaseTable) -> Self {
        Self { pool, table }
    }

    pub fn table(&self) -> &PhaseTable {
        &self.table
    }

    pub async fn create_if_absent(&self) -> Result<()> {
        let mut session = self.pool.session().await?;
        session
            .create_phase_table(&self.table)
            .await
            .map_err(|e| MigrateError::State(format!("creating {}: {}", self.table.name, e)))
    }

    pub async fn get(&self, phase: Phase) -> Result<bool> {
        let mut session = self.pool.session().await?;
        let value = session
            .read_phase(&self.table, phase)
            .await
            .map_err(|e| MigrateError::State(format!("reading {}: {}", phase, e)))?;
        debug!("Phase {} = {}", phase, value);
        Ok(value)
    }

    /// Set every listed flag to true in one statement.
    pub async fn set_many(&self, phases: &[Phase]) -> Result<()> {
        if phases.is_empty() {
            return Ok(());
        }
        let mut session = self.pool.session().await?;
        session
            .mark_phases(&self.table, phases)
            .await
            .map_err(|e| MigrateError::State(format!("updating {:?}: {}", phases, e)))?;
        info!(
            "Phase complete: {}",
            phases
                .iter()
                .map(|p| p.column())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Drop the phase table. Failures are logged, never returned.
    pub async fn drop(&self) {
        let result = match self.pool.session().await {
            Ok(mut session) => session.drop_phase_table(&self.table).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to drop phase table {}: {}", self.table.name, e);
        }
    }
}
