//! Database driver implementations.
//!
//! - [`mysql`]: MySQL source reader (sqlx)
//! - [`postgres`]: PostgreSQL target sessions (deadpool-postgres, COPY)
//! - [`common`]: Shared TLS settings

pub mod common;
pub mod mysql;
pub mod postgres;

pub use common::SslMode;
pub use mysql::MysqlReader;
pub use postgres::{PgSession, PgTarget};
