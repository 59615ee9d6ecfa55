//! PostgreSQL target driver.

mod session;

pub use session::{PgSession, PgTarget};
