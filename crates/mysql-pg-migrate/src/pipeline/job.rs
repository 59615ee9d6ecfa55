//! Data transfer task (Command pattern) for one table.
//!
//! A `DataTask` carries everything a worker pair needs to move one table:
//! the source read statement, the destination column order for COPY and a
//! row estimate for progress. Tasks are persisted in the work queue as JSON
//! and the queue assigns their `id`.

use serde::{Deserialize, Serialize};

use crate::core::identifier::{qualify_pg, quote_literal, quote_mysql, quote_pg};
use crate::error::Result;

/// One table's transfer work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTask {
    /// Queue row id. Not part of the payload.
    #[serde(skip)]
    pub id: i64,

    /// Destination table name.
    pub table_name: String,

    /// Source table name when it differs from the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table_name: Option<String>,

    /// Informational row count, reported as the loaded row count on success.
    pub row_count_estimate: i64,

    /// Select-list of the source read, with column transforms applied.
    pub select_field_list: String,

    /// Destination columns in the order the select-list produces them.
    pub destination_column_list: Vec<String>,
}

impl DataTask {
    /// Create a new task for a table.
    pub fn new(
        table_name: impl Into<String>,
        select_field_list: impl Into<String>,
        destination_column_list: Vec<String>,
        row_count_estimate: i64,
    ) -> Self {
        Self {
            id: 0,
            table_name: table_name.into(),
            source_table_name: None,
            row_count_estimate,
            select_field_list: select_field_list.into(),
            destination_column_list,
        }
    }

    /// Read from a differently named source table.
    pub fn with_source_table(mut self, name: impl Into<String>) -> Self {
        self.source_table_name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn source_table(&self) -> &str {
        self.source_table_name.as_deref().unwrap_or(&self.table_name)
    }

    /// The fully-formed source read statement.
    pub fn read_statement(&self) -> Result<String> {
        Ok(format!(
            "SELECT {} FROM {}",
            self.select_field_list,
            quote_mysql(self.source_table())?
        ))
    }

    /// The COPY statement matching the record encoder's settings.
    pub fn copy_statement(&self, schema: &str, delimiter: u8, encoding: &str) -> Result<String> {
        let columns = if self.destination_column_list.is_empty() {
            String::new()
        } else {
            let quoted = self
                .destination_column_list
                .iter()
                .map(|c| quote_pg(c))
                .collect::<Result<Vec<_>>>()?;
            format!(" ({})", quoted.join(", "))
        };

        Ok(format!(
            "COPY {}{} FROM STDIN WITH (FORMAT csv, DELIMITER {}, ENCODING {})",
            qualify_pg(schema, &self.table_name)?,
            columns,
            quote_literal(&(delimiter as char).to_string()),
            quote_literal(encoding)
        ))
    }

    /// Serialize for the work queue.
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a queue row.
    pub fn from_payload(id: i64, payload: &str) -> Result<Self> {
        let task: DataTask = serde_json::from_str(payload)?;
        Ok(task.with_id(id))
    }
}
