//! Worker pairs that move one table each.
//!
//! A pair is two tokio tasks joined by a bounded byte pipe:
//!
//! ```text
//!   source ──► Reader ──CSV chunks──► Writer ──COPY──► destination
//!                 ▲                      │
//!                 └──── start signal ────┘
//! ```
//!
//! The writer holds one destination session for the whole task. It runs the
//! existence probe, captures and disables the trigger mode, signals the
//! reader, streams the pipe into `COPY FROM STDIN`, then deletes the task row
//! and restores the trigger mode on that same session. Exactly one
//! [`Completion`] is sent per pair, on success, failure or panic.

mod csv;
mod guard;
mod reader;
mod writer;

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::traits::{SourceReader, TargetPool};
use crate::pipeline::DataTask;
use crate::queue::WorkQueue;

pub use csv::CsvEncoder;
pub use guard::{GuardDecision, SkipReason};
pub use writer::REPLICA_MODE;

/// Per-run settings shared by every pair.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Destination schema.
    pub schema: String,
    pub delimiter: u8,
    /// PostgreSQL encoding name used in COPY.
    pub encoding: String,
    pub fetch_batch_size: usize,
    /// Pipe capacity in chunks.
    pub pipe_buffers: usize,
    /// Switch the session to replica mode for the load.
    pub disable_triggers: bool,
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        let m = &config.migration;
        Self {
            schema: config.target.schema.clone(),
            delimiter: m.delimiter_byte(),
            encoding: m.pg_encoding().unwrap_or("UTF8").to_string(),
            fetch_batch_size: m.get_fetch_batch_size(),
            pipe_buffers: m.get_pipe_buffers(),
            disable_triggers: m.migrate_only_data,
        }
    }
}

/// Completion message for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub slot: usize,
    pub table_name: String,
    /// The task's row estimate on success, 0 on failure or skip.
    pub total_rows_to_insert: i64,
    /// Rows the destination acknowledged.
    pub rows_copied: u64,
}

/// One failed task, kept for the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub table: String,
    /// Source read statement of the task.
    pub statement: String,
    pub message: String,
}

/// Failures shared by all pairs of a run.
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    inner: Arc<Mutex<Vec<TaskFailure>>>,
}

impl FailureLog {
    pub fn record(&self, failure: TaskFailure) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(failure);
    }

    pub fn snapshot(&self) -> Vec<TaskFailure> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Sends the slot's completion when dropped, so a panicking writer still
/// frees its slot.
struct CompletionGuard {
    completion: Completion,
    done: mpsc::Sender<Completion>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        // Capacity equals the number of slots, so this never fills up
        let _ = self.done.try_send(self.completion.clone());
    }
}

/// Handles for a running reader and writer.
pub struct WorkerPair {
    pub slot: usize,
    pub table_name: String,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WorkerPair {
    /// Spawn both roles for `task` in `slot`.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<S: SourceReader, P: TargetPool>(
        slot: usize,
        task: DataTask,
        source: Arc<S>,
        target: Arc<P>,
        queue: Arc<WorkQueue<P>>,
        settings: Arc<TransferSettings>,
        failures: FailureLog,
        done: mpsc::Sender<Completion>,
    ) -> Self {
        let task = Arc::new(task);
        let table_name = task.table_name.clone();
        let (start_tx, start_rx) = oneshot::channel();
        let (pipe_tx, pipe_rx) = mpsc::channel(settings.pipe_buffers.max(1));

        let reader = tokio::spawn(reader::run_reader(
            task.clone(),
            source,
            settings.clone(),
            start_rx,
            pipe_tx,
        ));

        let guard = CompletionGuard {
            completion: Completion {
                slot,
                table_name: table_name.clone(),
                total_rows_to_insert: 0,
                rows_copied: 0,
            },
            done,
        };
        let writer = tokio::spawn(async move {
            // Bind the whole guard so it lives, and drops, inside the task
            let mut guard = guard;
            let outcome =
                writer::run_writer(task, target, queue, settings, failures, start_tx, pipe_rx)
                    .await;
            guard.completion.total_rows_to_insert = outcome.total_rows_to_insert;
            guard.completion.rows_copied = outcome.rows_copied;
        });

        Self {
            slot,
            table_name,
            reader,
            writer,
        }
    }

    /// Tear down both roles. Nothing of the pair survives into the next task.
    pub fn terminate(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::queue::QueueTable;
    use crate::testing::{FakeSource, FakeTarget};

    struct Fixture {
        source: Arc<FakeSource>,
        target: Arc<FakeTarget>,
        queue: Arc<WorkQueue<FakeTarget>>,
        failures: FailureLog,
    }

    async fn fixture(source: FakeSource, target: FakeTarget) -> Fixture {
        let target = Arc::new(target);
        let queue = Arc::new(WorkQueue::new(
            target.clone(),
            QueueTable::new("public", "shop"),
        ));
        queue.create().await.unwrap();
        Fixture {
            source: Arc::new(source),
            target,
            queue,
            failures: FailureLog::default(),
        }
    }

    fn settings(disable_triggers: bool) -> Arc<TransferSettings> {
        Arc::new(TransferSettings {
            schema: "public".to_string(),
            delimiter: b',',
            encoding: "UTF8".to_string(),
            fetch_batch_size: 10,
            pipe_buffers: 2,
            disable_triggers,
        })
    }

    async fn spawn_one(
        fx: &Fixture,
        table: &str,
        disable_triggers: bool,
    ) -> (WorkerPair, mpsc::Receiver<Completion>) {
        let task = DataTask::new(
            table,
            "`id`, `label`",
            vec!["id".to_string(), "label".to_string()],
            25,
        );
        let id = fx.queue.enqueue(&task).await.unwrap();
        let (done_tx, done_rx) = mpsc::channel(1);
        let pair = WorkerPair::spawn(
            0,
            task.with_id(id),
            fx.source.clone(),
            fx.target.clone(),
            fx.queue.clone(),
            settings(disable_triggers),
            fx.failures.clone(),
            done_tx,
        );
        (pair, done_rx)
    }

    async fn run_one(fx: &Fixture, table: &str, disable_triggers: bool) -> Completion {
        let (pair, mut done_rx) = spawn_one(fx, table, disable_triggers).await;
        let completion = done_rx.recv().await.unwrap();
        pair.terminate();
        completion
    }

    #[tokio::test]
    async fn test_completion_is_sent_after_writer_finishes() {
        let source = FakeSource::new().with_table("orders", 25);
        let gate = source.gate("orders");
        let fx = fixture(source, FakeTarget::new(2)).await;
        let (pair, mut done_rx) = spawn_one(&fx, "orders", false).await;

        // Reader is held, so the pair must still be running
        let early = tokio::time::timeout(Duration::from_millis(50), done_rx.recv()).await;
        assert!(early.is_err());
        assert_eq!(fx.target.queued_task_count(), 1);

        gate.notify_one();
        let completion = done_rx.recv().await.unwrap();
        assert_eq!(fx.target.queued_task_count(), 0);
        assert_eq!(fx.target.rows_in("orders"), 25);
        assert_eq!(completion.rows_copied, 25);
        pair.terminate();
    }

    #[tokio::test]
    async fn test_failed_dequeue_still_restores_trigger_mode() {
        let fx = fixture(FakeSource::new().with_table("orders", 5), FakeTarget::new(2)).await;
        let task = DataTask::new("orders", "`id`", vec!["id".to_string()], 5);
        let id = fx.queue.enqueue(&task).await.unwrap();
        // Queue table vanishes, so the DELETE in the final batch fails
        fx.queue.drop_queue().await;

        let (done_tx, mut done_rx) = mpsc::channel(1);
        let pair = WorkerPair::spawn(
            0,
            task.with_id(id),
            fx.source.clone(),
            fx.target.clone(),
            fx.queue.clone(),
            settings(true),
            fx.failures.clone(),
            done_tx,
        );
        done_rx.recv().await.unwrap();
        pair.terminate();

        assert!(fx.target.released_modes().iter().all(|m| m == "origin"));
        let events = fx.target.events();
        let disabled = events.iter().position(|e| e == "trigger:replica").unwrap();
        let restored = events.iter().position(|e| e == "trigger:origin").unwrap();
        assert!(disabled < restored);
        assert_eq!(fx.target.discarded_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_discarded_when_restore_fails() {
        let fx = fixture(FakeSource::new().with_table("orders", 5), FakeTarget::new(2)).await;
        let task = DataTask::new("orders", "`id`", vec!["id".to_string()], 5);
        let id = fx.queue.enqueue(&task).await.unwrap();
        fx.queue.drop_queue().await;
        fx.target.fail_trigger_restore();

        let (done_tx, mut done_rx) = mpsc::channel(1);
        let pair = WorkerPair::spawn(
            0,
            task.with_id(id),
            fx.source.clone(),
            fx.target.clone(),
            fx.queue.clone(),
            settings(true),
            fx.failures.clone(),
            done_tx,
        );
        done_rx.recv().await.unwrap();
        pair.terminate();

        assert_eq!(fx.target.discarded_sessions(), 1);
        assert!(!fx.target.released_modes().iter().any(|m| m == REPLICA_MODE));
    }

    #[tokio::test]
    async fn test_successful_pair_reports_estimate_and_dequeues() {
        let fx = fixture(FakeSource::new().with_table("orders", 25), FakeTarget::new(2)).await;
        let completion = run_one(&fx, "orders", false).await;

        assert_eq!(completion.table_name, "orders");
        assert_eq!(completion.total_rows_to_insert, 25);
        assert_eq!(completion.rows_copied, 25);
        assert_eq!(fx.target.rows_in("orders"), 25);
        assert_eq!(fx.target.queued_task_count(), 0);
        assert!(fx.failures.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_loaded_table_is_dequeued_without_copy() {
        let fx = fixture(
            FakeSource::new().with_table("orders", 25),
            FakeTarget::new(2).with_rows("orders", 25),
        )
        .await;
        let completion = run_one(&fx, "orders", false).await;

        assert_eq!(completion.total_rows_to_insert, 0);
        assert!(fx.target.copy_statements().is_empty());
        assert!(fx.source.queries().is_empty());
        assert_eq!(fx.target.queued_task_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_copy_logs_read_statement() {
        let fx = fixture(FakeSource::new().with_table("orders", 25), FakeTarget::new(2)).await;
        fx.target.fail_copy_for("orders");
        let completion = run_one(&fx, "orders", false).await;

        assert_eq!(completion.total_rows_to_insert, 0);
        assert_eq!(fx.target.rows_in("orders"), 0);
        assert_eq!(fx.target.queued_task_count(), 0);
        let failures = fx.failures.snapshot();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].statement, "SELECT `id`, `label` FROM `orders`");
    }

    #[tokio::test]
    async fn test_trigger_mode_restored_before_release() {
        let fx = fixture(FakeSource::new().with_table("orders", 5), FakeTarget::new(2)).await;
        run_one(&fx, "orders", true).await;
        let fx2 = fixture(FakeSource::new().with_table("items", 5), FakeTarget::new(2)).await;
        fx2.target.fail_copy_for("items");
        run_one(&fx2, "items", true).await;

        // Queue setup sessions plus the writer session each report their mode on release
        assert!(fx.target.released_modes().iter().all(|m| m == "origin"));
        assert!(fx2.target.released_modes().iter().all(|m| m == "origin"));
        assert!(fx.target.released_modes().len() >= 3);
        for events in [fx.target.events(), fx2.target.events()] {
            let disabled = events.iter().position(|e| e == "trigger:replica").unwrap();
            let restored = events.iter().position(|e| e == "restore:origin").unwrap();
            assert!(disabled < restored);
        }
    }

    #[tokio::test]
    async fn test_pool_session_is_released_after_completion() {
        let fx = fixture(FakeSource::new().with_table("orders", 5), FakeTarget::new(1)).await;
        run_one(&fx, "orders", false).await;
        // A single-session pool must be usable again
        let _session = fx.target.session().await.unwrap();
    }
}
