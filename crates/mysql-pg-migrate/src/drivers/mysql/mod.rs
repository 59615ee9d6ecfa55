//! MySQL source driver.

mod reader;

pub use reader::MysqlReader;
