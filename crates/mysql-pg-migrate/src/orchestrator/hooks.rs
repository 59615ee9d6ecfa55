//! No-op DDL hooks for data-only runs.
//!
//! Used when the destination schema, constraints and views are created by
//! another tool. Logs a warning on first use.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::schema::Table;
use crate::core::traits::SchemaHooks;
use crate::error::Result;

/// Schema hooks that do nothing.
pub struct NoOpSchemaHooks {
    warned: AtomicBool,
}

impl NoOpSchemaHooks {
    pub fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                "No schema hooks configured: destination tables, constraints and views \
                 must already exist."
            );
        }
    }
}

impl Default for NoOpSchemaHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaHooks for NoOpSchemaHooks {
    async fn create_tables(&self, tables: &[Table]) -> Result<()> {
        self.warn_once();
        debug!("Skipping table creation for {} tables", tables.len());
        Ok(())
    }

    async fn load_table_constraints(&self, table: &str) -> Result<()> {
        debug!("{}: no per-table constraints to load", table);
        Ok(())
    }

    async fn create_foreign_keys(&self) -> Result<()> {
        self.warn_once();
        Ok(())
    }

    async fn create_views(&self) -> Result<()> {
        self.warn_once();
        Ok(())
    }
}
