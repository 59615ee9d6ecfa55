//! MySQL source reader implementation.
//!
//! Implements the `SourceReader` trait for MySQL/MariaDB.
//! Uses SQLx for connection pooling; task reads are streamed row by row
//! with `fetch` and grouped into batches, never loaded whole.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Row, TypeInfo, ValueRef};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::core::schema::{Column, Table};
use crate::core::traits::SourceReader;
use crate::core::value::{Batch, SqlValue};
use crate::drivers::common::mysql_ssl_mode;
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Batches buffered ahead of the encoder.
const READ_AHEAD_BATCHES: usize = 4;

/// MySQL source reader.
pub struct MysqlReader {
    pool: MySqlPool,
}

impl MysqlReader {
    /// Connect with the session character set matching the COPY encoding.
    pub async fn new(config: &SourceConfig, max_conns: usize, charset: &str) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(mysql_ssl_mode(&config.ssl_mode)?)
            .charset(charset);

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL source pool"))?;

        info!(
            "Connected to MySQL source: {}:{}/{} (charset {})",
            config.host, config.port, config.database, charset
        );

        Ok(Self { pool })
    }

    async fn load_columns(&self, schema: &str) -> Result<HashMap<String, Vec<Column>>> {
        // CAST to CHAR because information_schema may return VARBINARY under some collations
        let query = r#"
            SELECT
                CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(DATA_TYPE AS CHAR(255)) AS DATA_TYPE,
                CAST(COLUMN_TYPE AS CHAR(1024)) AS COLUMN_TYPE,
                IF(IS_NULLABLE = 'YES', 1, 0) AS is_nullable,
                CAST(ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ?
            ORDER BY TABLE_NAME, ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "loading MySQL columns"))?;

        let mut columns: HashMap<String, Vec<Column>> = HashMap::new();
        for row in rows {
            let table: String = row.try_get("TABLE_NAME")?;
            columns.entry(table).or_default().push(Column {
                name: row.try_get("COLUMN_NAME")?,
                data_type: row.try_get("DATA_TYPE")?,
                column_type: row.try_get("COLUMN_TYPE")?,
                is_nullable: row.try_get::<i64, _>("is_nullable")? == 1,
                ordinal_pos: row.try_get::<i64, _>("ORDINAL_POSITION")? as i32,
            });
        }
        Ok(columns)
    }

    async fn load_primary_keys(&self, schema: &str) -> Result<HashMap<String, Vec<String>>> {
        let query = r#"
            SELECT
                CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY TABLE_NAME, ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "loading MySQL primary keys"))?;

        let mut keys: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let table: String = row.try_get("TABLE_NAME")?;
            keys.entry(table).or_default().push(row.try_get("COLUMN_NAME")?);
        }
        Ok(keys)
    }
}

#[async_trait]
impl SourceReader for MysqlReader {
    async fn extract_tables(&self, schema: &str) -> Result<Vec<Table>> {
        let query = r#"
            SELECT
                CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
                CAST(COALESCE(TABLE_ROWS, 0) AS SIGNED) AS TABLE_ROWS
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "extracting MySQL tables"))?;

        let mut columns = self.load_columns(schema).await?;
        let mut keys = self.load_primary_keys(schema).await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("TABLE_NAME")?;
            tables.push(Table {
                schema: schema.to_string(),
                columns: columns.remove(&name).unwrap_or_default(),
                primary_key: keys.remove(&name).unwrap_or_default(),
                row_count: row.try_get("TABLE_ROWS")?,
                name,
            });
        }

        info!(
            "Extracted {} tables from MySQL schema '{}'",
            tables.len(),
            schema
        );
        Ok(tables)
    }

    fn stream_query(&self, sql: String, batch_size: usize) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(READ_AHEAD_BATCHES);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            if let Err(e) = stream_rows(&pool, &sql, batch_size.max(1), &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }
}

async fn stream_rows(
    pool: &MySqlPool,
    sql: &str,
    batch_size: usize,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let mut rows = sqlx::query(sql).fetch(pool);
    let mut batch = Vec::with_capacity(batch_size);
    let mut total = 0usize;

    while let Some(row) = rows.try_next().await? {
        batch.push(decode_row(&row)?);
        if batch.len() == batch_size {
            total += batch.len();
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.send(Ok(Batch::new(full))).await.is_err() {
                // Receiver dropped
                return Ok(());
            }
        }
    }

    total += batch.len();
    if !batch.is_empty() {
        let _ = tx.send(Ok(Batch::new(batch))).await;
    }
    debug!("Streamed {} rows", total);
    Ok(())
}

fn decode_row(row: &MySqlRow) -> Result<Vec<SqlValue>> {
    (0..row.len()).map(|i| decode_value(row, i)).collect()
}

/// Decode one column by its wire type.
///
/// Character columns keep their raw bytes, which are already in the
/// session character set.
fn decode_value(row: &MySqlRow, i: usize) -> Result<SqlValue> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_uppercase();
    let unsigned = type_name.ends_with("UNSIGNED");
    let base = type_name.split_whitespace().next().unwrap_or_default();

    let value = match base {
        "NULL" => SqlValue::Null,
        "BOOLEAN" => SqlValue::Bool(row.try_get(i)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" if unsigned => {
            SqlValue::UInt(row.try_get(i)?)
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => SqlValue::Int(row.try_get(i)?),
        "YEAR" => SqlValue::UInt(row.try_get_unchecked::<u16, _>(i)? as u64),
        "FLOAT" => SqlValue::Float(row.try_get::<f32, _>(i)? as f64),
        "DOUBLE" => SqlValue::Float(row.try_get(i)?),
        "DECIMAL" => SqlValue::Decimal(row.try_get(i)?),
        "DATE" => SqlValue::Date(row.try_get(i)?),
        "TIME" => SqlValue::Time(row.try_get(i)?),
        "DATETIME" | "TIMESTAMP" => SqlValue::DateTime(row.try_get(i)?),
        "BIT" => SqlValue::Text(bit_string(&row.try_get_unchecked::<Vec<u8>, _>(i)?)),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "GEOMETRY" => {
            SqlValue::Bytes(row.try_get_unchecked(i)?)
        }
        _ => SqlValue::Text(row.try_get_unchecked(i)?),
    };
    Ok(value)
}

/// `b'101'` style bit string without leading zeros.
fn bit_string(bytes: &[u8]) -> Vec<u8> {
    let bits: String = bytes.iter().map(|b| format!("{:08b}", b)).collect();
    let trimmed = bits.trim_start_matches('0');
    if trimmed.is_empty() {
        b"0".to_vec()
    } else {
        trimmed.as_bytes().to_vec()
    }
}
