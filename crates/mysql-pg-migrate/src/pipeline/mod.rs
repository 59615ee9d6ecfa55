//! What gets transferred.
//!
//! - [`DataTask`]: Command pattern encapsulating one table's transfer
//! - [`TaskPlanner`]: builds tasks from source table metadata
//!
//! Tasks are planned once at structure-load time, persisted in the work
//! queue, and executed later by the scheduler, possibly in another run.

mod job;
mod planner;

pub use job::DataTask;
pub use planner::{plan_table, select_expression, TaskPlanner};
