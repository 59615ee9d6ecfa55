//! Source table metadata used to plan transfer tasks.

use serde::{Deserialize, Serialize};

/// Table metadata extracted from the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Schema (MySQL database) name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Column definitions in ordinal order.
    pub columns: Vec<Column>,

    /// Primary key column names.
    pub primary_key: Vec<String>,

    /// Approximate row count from `INFORMATION_SCHEMA.TABLES`.
    pub row_count: i64,
}

impl Table {
    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Column metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// `DATA_TYPE` as reported by MySQL (e.g. "int", "varchar", "geometry").
    pub data_type: String,

    /// `COLUMN_TYPE` with length and modifiers (e.g. "int(10) unsigned").
    pub column_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

impl Column {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            column_type: data_type.to_string(),
            is_nullable: true,
            ordinal_pos: 0,
        }
    }
}
