//! Configuration validation.

use super::Config;
use crate::drivers::common::SslMode;
use crate::error::{MigrateError, Result};

const MYSQL_SSL_MODES: &[&str] = &[
    "disabled",
    "preferred",
    "required",
    "verify_ca",
    "verify_identity",
];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mysql" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mysql', got '{}'",
            config.source.r#type
        )));
    }
    if !MYSQL_SSL_MODES.contains(&config.source.ssl_mode.to_lowercase().as_str()) {
        return Err(MigrateError::Config(format!(
            "source.ssl_mode must be one of {:?}, got '{}'",
            MYSQL_SSL_MODES, config.source.ssl_mode
        )));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.schema.is_empty() {
        return Err(MigrateError::Config("target.schema is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    SslMode::parse(&config.target.ssl_mode)?;

    // Cannot migrate to the same database
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    // Migration config validation - only check if explicitly set
    let migration = &config.migration;
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.max_pg_connections {
        return Err(MigrateError::Config(
            "migration.max_pg_connections must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.max_mysql_connections {
        return Err(MigrateError::Config(
            "migration.max_mysql_connections must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.fetch_batch_size {
        return Err(MigrateError::Config(
            "migration.fetch_batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.pipe_buffers {
        return Err(MigrateError::Config(
            "migration.pipe_buffers must be at least 1".into(),
        ));
    }

    let delimiter = migration.delimiter;
    if !delimiter.is_ascii() || matches!(delimiter, '"' | '\r' | '\n' | '\\') {
        return Err(MigrateError::Config(format!(
            "migration.delimiter must be a single ASCII character other than quote, backslash or newline, got {:?}",
            delimiter
        )));
    }

    if migration.pg_encoding().is_none() {
        return Err(MigrateError::Config(format!(
            "migration.encoding '{}' is not supported",
            migration.encoding
        )));
    }

    Ok(())
}
