//! Writer role: probe, bulk load and dequeue on one held session.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::core::traits::{TargetPool, TargetSession};
use crate::error::{MigrateError, Result};
use crate::pipeline::DataTask;
use crate::queue::WorkQueue;
use crate::transfer::guard::{self, GuardDecision};
use crate::transfer::{FailureLog, TaskFailure, TransferSettings};

/// Trigger mode under which replication-role triggers and FK checks are off.
pub const REPLICA_MODE: &str = "replica";

/// What the writer reports back to the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriterOutcome {
    pub total_rows_to_insert: i64,
    pub rows_copied: u64,
}

/// Run the destination side of one task.
///
/// The task row is deleted on every path that holds a session, with the
/// captured trigger mode restored in the same call.
pub(crate) async fn run_writer<P: TargetPool>(
    task: Arc<DataTask>,
    target: Arc<P>,
    queue: Arc<WorkQueue<P>>,
    settings: Arc<TransferSettings>,
    failures: FailureLog,
    start: oneshot::Sender<()>,
    pipe: mpsc::Receiver<Result<Bytes>>,
) -> WriterOutcome {
    let table = task.table_name.as_str();

    let mut session = match target.session().await {
        Ok(session) => session,
        Err(e) => {
            // Without a session the row cannot be deleted; it stays queued for the next run
            report(&failures, &task, &e);
            return WriterOutcome::default();
        }
    };

    let decision = guard::check(&mut session, &settings.schema, table).await;
    if let GuardDecision::Skip(_) = decision {
        drop(start);
        finish(&*queue, session, &task, None).await;
        return WriterOutcome::default();
    }

    let mut restore = None;
    if settings.disable_triggers {
        let disabled = disable_triggers(&mut session).await;
        match disabled {
            Ok(original) => restore = Some(original),
            Err(e) => {
                report(&failures, &task, &e);
                finish(&*queue, session, &task, None).await;
                return WriterOutcome::default();
            }
        }
    }

    let outcome = match load(&mut session, &task, &settings, start, pipe).await {
        Ok(copied) => {
            info!(
                "{}: loaded {} rows (estimate {})",
                table, copied, task.row_count_estimate
            );
            WriterOutcome {
                total_rows_to_insert: task.row_count_estimate,
                rows_copied: copied,
            }
        }
        Err(e) => {
            report(&failures, &task, &e);
            WriterOutcome::default()
        }
    };

    finish(&*queue, session, &task, restore.as_deref()).await;
    outcome
}

async fn disable_triggers<T: TargetSession>(session: &mut T) -> Result<String> {
    let original = session.trigger_mode().await?;
    session.set_trigger_mode(REPLICA_MODE).await?;
    Ok(original)
}

async fn load<T: TargetSession>(
    session: &mut T,
    task: &DataTask,
    settings: &TransferSettings,
    start: oneshot::Sender<()>,
    pipe: mpsc::Receiver<Result<Bytes>>,
) -> Result<u64> {
    let statement = task.copy_statement(&settings.schema, settings.delimiter, &settings.encoding)?;
    if start.send(()).is_err() {
        return Err(MigrateError::transfer(&task.table_name, "reader exited before start"));
    }
    session.copy_in(&statement, pipe).await
}

async fn finish<P: TargetPool>(
    queue: &WorkQueue<P>,
    mut session: P::Session,
    task: &DataTask,
    restore: Option<&str>,
) {
    let Err(e) = queue.dequeue_delete(&mut session, task.id, restore).await else {
        return;
    };
    warn!(
        "{}: failed to remove task {} from {}: {}",
        task.table_name,
        task.id,
        queue.table().name(),
        e
    );

    // A failed batch stops before the restore, so the mode is set on its own
    let Some(mode) = restore else {
        return;
    };
    let restored = session.set_trigger_mode(mode).await;
    if let Err(e) = restored {
        error!(
            "{}: could not restore trigger mode '{}', closing session: {}",
            task.table_name, mode, e
        );
        session.discard();
    }
}

fn report(failures: &FailureLog, task: &DataTask, e: &MigrateError) {
    let statement = task
        .read_statement()
        .unwrap_or_else(|_| task.select_field_list.clone());
    error!("{}: {} [read statement: {}]", task.table_name, e, statement);
    failures.record(TaskFailure {
        table: task.table_name.clone(),
        statement,
        message: e.to_string(),
    });
}
