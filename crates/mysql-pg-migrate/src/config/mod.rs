//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

/// PostgreSQL encoding names and the MySQL character set that produces the
/// same bytes on the wire.
const ENCODINGS: &[(&str, &str)] = &[
    ("UTF8", "utf8mb4"),
    ("LATIN1", "latin1"),
    ("LATIN2", "latin2"),
    ("WIN1250", "cp1250"),
    ("WIN1251", "cp1251"),
    ("WIN1252", "latin1"),
    ("SQL_ASCII", "ascii"),
    ("EUC_JP", "ujis"),
    ("SJIS", "sjis"),
    ("EUC_KR", "euckr"),
    ("GBK", "gbk"),
    ("BIG5", "big5"),
];

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Configuration rendered for the log, with passwords removed.
    pub fn redacted_summary(&self) -> String {
        format!(
            "source={}@{}:{}/{} target={}@{}:{}/{} schema={} workers={} delimiter={:?} encoding={} migrate_only_data={}",
            self.source.user,
            self.source.host,
            self.source.port,
            self.source.database,
            self.target.user,
            self.target.host,
            self.target.port,
            self.target.database,
            self.target.schema,
            self.migration
                .workers
                .map(|w| w.to_string())
                .unwrap_or_else(|| "auto".to_string()),
            self.migration.delimiter,
            self.migration.encoding,
            self.migration.migrate_only_data,
        )
    }
}

impl MigrationConfig {
    /// Canonical PostgreSQL encoding name, if supported.
    pub fn pg_encoding(&self) -> Option<&'static str> {
        let wanted = normalize_encoding(&self.encoding);
        ENCODINGS
            .iter()
            .find(|(pg, _)| *pg == wanted)
            .map(|(pg, _)| *pg)
    }

    /// MySQL session character set matching the configured encoding.
    pub fn mysql_charset(&self) -> Option<&'static str> {
        let wanted = normalize_encoding(&self.encoding);
        ENCODINGS
            .iter()
            .find(|(pg, _)| *pg == wanted)
            .map(|(_, mysql)| *mysql)
    }

    /// The delimiter as a single byte. Validation guarantees it is ASCII.
    pub fn delimiter_byte(&self) -> u8 {
        if self.delimiter.is_ascii() {
            self.delimiter as u8
        } else {
            b','
        }
    }
}

fn normalize_encoding(name: &str) -> String {
    let upper = name.trim().to_uppercase().replace('-', "");
    match upper.as_str() {
        "UTF8MB4" | "UNICODE" => "UTF8".to_string(),
        "ISO88591" => "LATIN1".to_string(),
        "ISO88592" => "LATIN2".to_string(),
        _ => upper,
    }
}
