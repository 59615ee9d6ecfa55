//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len().max(1);

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MySQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mysql").
    #[serde(default = "default_mysql")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name. Also used to name the work queue and phase tables.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// TLS mode: disabled, preferred, required, verify_ca, verify_identity.
    #[serde(default = "default_preferred")]
    pub ssl_mode: String,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres").
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
/// All performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Upper bound on concurrently running worker pairs. Unset means no cap
    /// beyond CPU count and pool size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,

    /// Maximum MySQL connections. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mysql_connections: Option<usize>,

    /// Rows encoded into one pipe chunk. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_batch_size: Option<usize>,

    /// Chunks in flight between a reader and its writer. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_buffers: Option<usize>,

    /// CSV field delimiter (default: ',').
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// PostgreSQL encoding name used for COPY; the MySQL session charset follows it.
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Load data into an existing schema with triggers disabled during COPY.
    #[serde(default)]
    pub migrate_only_data: bool,

    /// Tables to include (glob patterns).
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (glob patterns).
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_pg_connections: None,
            max_mysql_connections: None,
            fetch_batch_size: None,
            pipe_buffers: None,
            delimiter: default_delimiter(),
            encoding: default_encoding(),
            migrate_only_data: false,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // One session per worker pair plus one for queue and phase bookkeeping
        if self.max_pg_connections.is_none() {
            let conns = (cores + 1).max(4).min(64);
            self.max_pg_connections = Some(conns);
        }

        if self.max_mysql_connections.is_none() {
            let conns = (cores + 1).max(4).min(64);
            self.max_mysql_connections = Some(conns);
        }

        // Base: 1K rows, +1K per 8GB of RAM, cap at 10K
        if self.fetch_batch_size.is_none() {
            let rows = 1_000 + ((ram_gb / 8.0) as usize * 1_000);
            self.fetch_batch_size = Some(rows.max(1_000).min(10_000));
        }

        if self.pipe_buffers.is_none() {
            let buffers = ((ram_gb / 4.0) as usize).max(4).min(32);
            self.pipe_buffers = Some(buffers);
        }

        info!(
            "Auto-tuned config: workers={}, pg_conns={}, mysql_conns={}, fetch_batch_size={}, pipe_buffers={}",
            self.workers
                .map(|w| w.to_string())
                .unwrap_or_else(|| "auto".to_string()),
            self.get_max_pg_connections(),
            self.get_max_mysql_connections(),
            self.get_fetch_batch_size(),
            self.get_pipe_buffers(),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback defaults)
    // These are used when the config hasn't been auto-tuned yet

    pub fn get_max_pg_connections(&self) -> usize {
        self.max_pg_connections.unwrap_or(8)
    }

    pub fn get_max_mysql_connections(&self) -> usize {
        self.max_mysql_connections.unwrap_or(8)
    }

    pub fn get_fetch_batch_size(&self) -> usize {
        self.fetch_batch_size.unwrap_or(1_000)
    }

    pub fn get_pipe_buffers(&self) -> usize {
        self.pipe_buffers.unwrap_or(8)
    }
}

// Default value functions for serde
fn default_mysql() -> String {
    "mysql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_preferred() -> String {
    "preferred".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_encoding() -> String {
    "UTF8".to_string()
}
