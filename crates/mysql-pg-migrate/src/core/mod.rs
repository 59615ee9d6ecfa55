//! Core abstractions shared by the drivers and the transfer engine.
//!
//! - [`schema`]: source table and column metadata
//! - [`value`]: values and batches streamed from the source
//! - [`traits`]: source, target and DDL seams
//! - [`identifier`]: identifier validation and quoting

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{Column, Table};
pub use traits::{SchemaHooks, SourceReader, TargetPool, TargetSession};
pub use value::{Batch, SqlValue};
