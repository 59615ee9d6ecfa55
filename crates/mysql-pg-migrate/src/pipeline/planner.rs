//! Task planner: turns source table metadata into transfer tasks.
//!
//! The select-list converts values PostgreSQL cannot take verbatim in CSV:
//! binary columns become bytea hex, spatial columns hex WKB, bit columns a
//! bit string, and MySQL zero dates become `-INFINITY`.

use tracing::{debug, warn};

use crate::config::MigrationConfig;
use crate::core::identifier::quote_mysql;
use crate::core::schema::{Column, Table};
use crate::error::Result;
use crate::pipeline::job::DataTask;

const BINARY_TYPES: &[&str] = &[
    "binary",
    "varbinary",
    "blob",
    "tinyblob",
    "mediumblob",
    "longblob",
];

const SPATIAL_TYPES: &[&str] = &[
    "geometry",
    "point",
    "linestring",
    "polygon",
    "multipoint",
    "multilinestring",
    "multipolygon",
    "geometrycollection",
    "geomcollection",
];

const DATE_TYPES: &[&str] = &["date", "datetime", "timestamp"];

/// Builds one [`DataTask`] per selected table.
#[derive(Debug, Clone, Default)]
pub struct TaskPlanner {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TaskPlanner {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.include_tables.clone(), config.exclude_tables.clone())
    }

    /// Whether a table passes the include/exclude patterns.
    pub fn selects(&self, table: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| glob_match(p, table));
        included && !self.exclude.iter().any(|p| glob_match(p, table))
    }

    /// Drop tables filtered out by the include/exclude patterns.
    pub fn filter_tables(&self, tables: Vec<Table>) -> Vec<Table> {
        tables
            .into_iter()
            .filter(|t| {
                let keep = self.selects(&t.name);
                if !keep {
                    debug!("{}: excluded by table filters", t.name);
                }
                keep
            })
            .collect()
    }

    /// Plan tasks for every table that has columns.
    pub fn plan(&self, tables: &[Table]) -> Result<Vec<DataTask>> {
        let mut tasks = Vec::with_capacity(tables.len());
        for table in tables {
            if table.columns.is_empty() {
                warn!("{}: no columns found, skipping", table.full_name());
                continue;
            }
            tasks.push(plan_table(table)?);
        }
        Ok(tasks)
    }
}

/// Build the task for a single table.
pub fn plan_table(table: &Table) -> Result<DataTask> {
    let fields = table
        .columns
        .iter()
        .map(select_expression)
        .collect::<Result<Vec<_>>>()?;

    Ok(DataTask::new(
        table.name.clone(),
        fields.join(", "),
        table.column_names(),
        table.row_count.max(0),
    ))
}

/// Select-list entry for one column, aliased back to the column name.
pub fn select_expression(column: &Column) -> Result<String> {
    let col = quote_mysql(&column.name)?;
    let data_type = column.data_type.to_lowercase();

    let expr = if BINARY_TYPES.contains(&data_type.as_str()) {
        format!("CONCAT('\\\\x', HEX({col})) AS {col}")
    } else if SPATIAL_TYPES.contains(&data_type.as_str()) {
        format!("HEX(ST_AsWKB({col})) AS {col}")
    } else if data_type == "bit" {
        format!("BIN({col}) AS {col}")
    } else if DATE_TYPES.contains(&data_type.as_str()) {
        format!(
            "IF({col} IN ('0000-00-00', '0000-00-00 00:00:00'), '-INFINITY', CAST({col} AS CHAR)) AS {col}"
        )
    } else {
        col
    };

    Ok(expr)
}

/// Case-insensitive glob with `*` and `?`.
fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let n: Vec<char> = name.to_lowercase().chars().collect();

    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
