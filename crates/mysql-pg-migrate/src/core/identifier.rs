//! Identifier validation and quoting for dynamically built SQL.
//!
//! Table and column names cannot be bound as parameters, so every statement
//! that embeds one goes through these helpers: names are validated (non-empty,
//! no NUL bytes, bounded length) and quoted with the engine's quote character
//! doubled inside.

use crate::error::{MigrateError, Result};

/// Maximum identifier length accepted from configuration or metadata.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const PG_MAX_IDENTIFIER_BYTES: usize = 63;

/// Validate an identifier for security issues.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Render a string as a single-quoted SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Shorten a name to PostgreSQL's identifier limit on a char boundary.
pub fn truncate_pg(name: &str) -> String {
    if name.len() <= PG_MAX_IDENTIFIER_BYTES {
        return name.to_string();
    }
    let mut end = PG_MAX_IDENTIFIER_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
