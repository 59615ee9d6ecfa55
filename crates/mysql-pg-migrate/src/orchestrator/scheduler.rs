//! Pipe manager: runs the loaded task pool through at most `W` worker pairs.
//!
//! Every slot runs one pair at a time. When a pair reports completion it is
//! torn down, a "table loading finished" notification goes out with the
//! table name, and the slot is refilled from the pool if anything is left.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::traits::{SourceReader, TargetPool};
use crate::pipeline::DataTask;
use crate::queue::WorkQueue;
use crate::transfer::{Completion, FailureLog, TaskFailure, TransferSettings, WorkerPair};

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Draining,
    Done,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Draining => "draining",
            SchedulerState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Number of concurrent worker pairs for a run.
///
/// Zero only when there is nothing to do.
pub fn concurrency_width(
    cpu_cores: usize,
    pool_size: usize,
    remaining_tasks: usize,
    cap: Option<usize>,
) -> usize {
    if remaining_tasks == 0 {
        return 0;
    }
    let width = cpu_cores
        .min(pool_size)
        .min(remaining_tasks)
        .min(cap.unwrap_or(usize::MAX));
    width.max(1)
}

/// What one scheduler run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub width: usize,
    pub tables_completed: usize,
    /// Sum of reported `totalRowsToInsert`.
    pub rows_reported: i64,
    /// Rows acknowledged by the destination.
    pub rows_copied: u64,
    pub failures: Vec<TaskFailure>,
    pub peak_workers: usize,
    pub duration_seconds: f64,
}

/// Coordinates worker pairs over one task pool.
pub struct PipeManager<S: SourceReader, P: TargetPool> {
    source: Arc<S>,
    target: Arc<P>,
    queue: Arc<WorkQueue<P>>,
    settings: Arc<TransferSettings>,
    cpu_cores: usize,
    cap: Option<usize>,
    state: SchedulerState,
    history: Vec<SchedulerState>,
}

impl<S: SourceReader, P: TargetPool> PipeManager<S, P> {
    pub fn new(
        source: Arc<S>,
        target: Arc<P>,
        queue: Arc<WorkQueue<P>>,
        settings: Arc<TransferSettings>,
        cpu_cores: usize,
        cap: Option<usize>,
    ) -> Self {
        Self {
            source,
            target,
            queue,
            settings,
            cpu_cores,
            cap,
            state: SchedulerState::Idle,
            history: vec![SchedulerState::Idle],
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Every state the scheduler has been in, in order.
    pub fn history(&self) -> &[SchedulerState] {
        &self.history
    }

    fn transition(&mut self, next: SchedulerState) {
        debug!("Scheduler {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Run every task in `pool` and resolve when the last pair completes.
    ///
    /// Each completed table is sent on `finished` after its pair is torn down.
    /// The sender is dropped on return, which closes the channel.
    pub async fn run(
        &mut self,
        mut pool: Vec<DataTask>,
        finished: mpsc::UnboundedSender<String>,
    ) -> LoadSummary {
        let started = Instant::now();
        let total = pool.len();
        let width = concurrency_width(self.cpu_cores, self.target.max_size(), total, self.cap);
        let mut summary = LoadSummary {
            width,
            ..Default::default()
        };

        if pool.is_empty() {
            info!("No tasks queued, data loading already complete");
            self.transition(SchedulerState::Done);
            return summary;
        }

        info!("Loading {} tables with {} worker pairs", total, width);
        self.transition(SchedulerState::Running);

        let failures = FailureLog::default();
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(width);
        let mut slots: Vec<Option<WorkerPair>> = (0..width).map(|_| None).collect();
        let mut active = 0usize;

        for (slot, entry) in slots.iter_mut().enumerate() {
            if let Some(task) = pool.pop() {
                *entry = Some(self.spawn(slot, task, &failures, &done_tx));
                active += 1;
            }
        }
        summary.peak_workers = active;
        if pool.is_empty() {
            self.transition(SchedulerState::Draining);
        }

        while active > 0 {
            let Some(completion) = done_rx.recv().await else {
                break;
            };

            if let Some(pair) = slots.get_mut(completion.slot).and_then(Option::take) {
                pair.terminate();
            }

            summary.tables_completed += 1;
            summary.rows_reported += completion.total_rows_to_insert;
            summary.rows_copied += completion.rows_copied;
            info!(
                "[{}/{}] {}: {} rows",
                summary.tables_completed,
                total,
                completion.table_name,
                completion.total_rows_to_insert
            );
            let _ = finished.send(completion.table_name);

            match pool.pop() {
                Some(task) => {
                    slots[completion.slot] =
                        Some(self.spawn(completion.slot, task, &failures, &done_tx));
                    if pool.is_empty() {
                        self.transition(SchedulerState::Draining);
                    }
                }
                None => active -= 1,
            }
        }

        self.transition(SchedulerState::Done);
        summary.failures = failures.snapshot();
        summary.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            "Data loading finished: {} tables, {} failed, {:.1}s",
            summary.tables_completed,
            summary.failures.len(),
            summary.duration_seconds
        );
        summary
    }

    fn spawn(
        &self,
        slot: usize,
        task: DataTask,
        failures: &FailureLog,
        done: &mpsc::Sender<Completion>,
    ) -> WorkerPair {
        debug!("Slot {}: starting {}", slot, task.table_name);
        WorkerPair::spawn(
            slot,
            task,
            self.source.clone(),
            self.target.clone(),
            self.queue.clone(),
            self.settings.clone(),
            failures.clone(),
            done.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueTable;
    use crate::testing::{FakeSource, FakeTarget};

    fn settings() -> Arc<TransferSettings> {
        Arc::new(TransferSettings {
            schema: "public".to_string(),
            delimiter: b',',
            encoding: "UTF8".to_string(),
            fetch_batch_size: 4,
            pipe_buffers: 2,
            disable_triggers: false,
        })
    }

    fn task(table: &str, rows: i64) -> DataTask {
        DataTask::new(
            table,
            "`id`, `label`",
            vec!["id".to_string(), "label".to_string()],
            rows,
        )
    }

    struct Harness {
        source: Arc<FakeSource>,
        target: Arc<FakeTarget>,
        queue: Arc<WorkQueue<FakeTarget>>,
    }

    impl Harness {
        async fn new(source: FakeSource, target: FakeTarget, tables: &[(&str, i64)]) -> Self {
            let target = Arc::new(target);
            let queue = Arc::new(WorkQueue::new(
                target.clone(),
                QueueTable::new("public", "shop"),
            ));
            queue.create().await.unwrap();
            for (name, rows) in tables {
                queue.enqueue(&task(name, *rows)).await.unwrap();
            }
            Self {
                source: Arc::new(source),
                target,
                queue,
            }
        }

        fn manager(&self, cpus: usize, cap: Option<usize>) -> PipeManager<FakeSource, FakeTarget> {
            PipeManager::new(
                self.source.clone(),
                self.target.clone(),
                self.queue.clone(),
                settings(),
                cpus,
                cap,
            )
        }

        async fn run(
            &self,
            manager: &mut PipeManager<FakeSource, FakeTarget>,
        ) -> (LoadSummary, Vec<String>) {
            let pool = self.queue.load_all().await.unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let summary = manager.run(pool, tx).await;
            let mut finished = Vec::new();
            while let Some(table) = rx.recv().await {
                finished.push(table);
            }
            (summary, finished)
        }
    }

    #[test]
    fn test_concurrency_width() {
        assert_eq!(concurrency_width(8, 4, 10, None), 4);
        assert_eq!(concurrency_width(2, 10, 10, None), 2);
        assert_eq!(concurrency_width(8, 10, 3, None), 3);
        assert_eq!(concurrency_width(8, 10, 10, Some(5)), 5);
        assert_eq!(concurrency_width(8, 10, 0, None), 0);
        assert_eq!(concurrency_width(0, 10, 3, Some(0)), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_goes_straight_to_done() {
        let h = Harness::new(FakeSource::new(), FakeTarget::new(4), &[]).await;
        let mut manager = h.manager(4, None);
        let (summary, finished) = h.run(&mut manager).await;
        assert_eq!(summary.width, 0);
        assert!(finished.is_empty());
        assert_eq!(
            manager.history(),
            &[SchedulerState::Idle, SchedulerState::Done]
        );
    }

    #[tokio::test]
    async fn test_queue_drains_for_any_width() {
        let tables: Vec<(String, i64)> = (0..7).map(|i| (format!("t{}", i), 3)).collect();
        for cap in [1, 2, 7] {
            let mut source = FakeSource::new();
            for (name, _) in &tables {
                source = source.with_table(name, 3);
            }
            let refs: Vec<(&str, i64)> = tables.iter().map(|(n, r)| (n.as_str(), *r)).collect();
            let h = Harness::new(source, FakeTarget::new(8), &refs).await;
            let mut manager = h.manager(8, Some(cap));
            let (summary, finished) = h.run(&mut manager).await;

            assert_eq!(h.target.queued_task_count(), 0);
            assert_eq!(summary.tables_completed, 7);
            assert_eq!(summary.rows_reported, 21);
            assert_eq!(finished.len(), 7);
            assert!(summary.peak_workers <= cap);
            assert_eq!(
                manager.history(),
                &[
                    SchedulerState::Idle,
                    SchedulerState::Running,
                    SchedulerState::Draining,
                    SchedulerState::Done
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_three_tasks_two_slots() {
        let source = FakeSource::new()
            .with_table("a", 5)
            .with_table("b", 5)
            .with_table("c", 5);
        let gate_a = source.gate("a");
        let gate_b = source.gate("b");
        let gate_c = source.gate("c");
        let h = Harness::new(source, FakeTarget::new(2), &[("a", 5), ("b", 5), ("c", 5)]).await;
        let mut manager = h.manager(16, None);

        let pool = h.queue.load_all().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = h.target.clone();
        let run = tokio::spawn(async move {
            let summary = manager.run(pool, tx).await;
            (summary, manager)
        });

        // Pool is a stack: c and b start first and hold both sessions
        gate_c.notify_one();
        assert_eq!(rx.recv().await.unwrap(), "c");
        gate_b.notify_one();
        assert_eq!(rx.recv().await.unwrap(), "b");
        gate_a.notify_one();
        assert_eq!(rx.recv().await.unwrap(), "a");

        let (summary, manager) = run.await.unwrap();
        assert_eq!(summary.width, 2);
        assert_eq!(summary.peak_workers, 2);
        assert!(target.peak_sessions() <= 2);
        assert_eq!(target.queued_task_count(), 0);
        assert_eq!(manager.state(), SchedulerState::Done);
    }

    #[tokio::test]
    async fn test_notification_overlaps_running_transfer() {
        let source = FakeSource::new().with_table("fast", 2).with_table("slow", 2);
        let slow = source.gate("slow");
        let h = Harness::new(source, FakeTarget::new(2), &[("slow", 2), ("fast", 2)]).await;
        let mut manager = h.manager(2, None);

        let pool = h.queue.load_all().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(async move { manager.run(pool, tx).await });

        // "fast" finishes while "slow" is still blocked in its read
        assert_eq!(rx.recv().await.unwrap(), "fast");
        assert!(!run.is_finished());
        assert_eq!(h.target.rows_in("slow"), 0);

        slow.notify_one();
        assert_eq!(rx.recv().await.unwrap(), "slow");
        let summary = run.await.unwrap();
        assert_eq!(summary.tables_completed, 2);
        // Channel closes once the scheduler resolves
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resume_skips_loaded_tables() {
        let fresh = Harness::new(
            FakeSource::new().with_table("orders", 10),
            FakeTarget::new(2),
            &[("orders", 10)],
        )
        .await;
        let (summary, _) = fresh.run(&mut fresh.manager(2, None)).await;
        assert_eq!(summary.rows_copied, 10);
        assert_eq!(fresh.target.copy_statements().len(), 1);

        let resumed = Harness::new(
            FakeSource::new().with_table("orders", 10),
            FakeTarget::new(2).with_rows("orders", 10),
            &[("orders", 10)],
        )
        .await;
        let (summary, finished) = resumed.run(&mut resumed.manager(2, None)).await;
        assert_eq!(summary.rows_reported, 0);
        assert!(resumed.target.copy_statements().is_empty());
        assert_eq!(resumed.target.probe_count(), 1);
        assert_eq!(resumed.target.queued_task_count(), 0);
        assert_eq!(finished, vec!["orders"]);
    }

    #[tokio::test]
    async fn test_failed_task_frees_its_slot() {
        let source = FakeSource::new()
            .with_table("bad", 4)
            .with_table("good1", 4)
            .with_table("good2", 4);
        let h = Harness::new(
            source,
            FakeTarget::new(1),
            &[("good1", 4), ("good2", 4), ("bad", 4)],
        )
        .await;
        h.target.fail_copy_for("bad");
        let mut manager = h.manager(1, None);
        let (summary, finished) = h.run(&mut manager).await;

        assert_eq!(finished, vec!["bad", "good2", "good1"]);
        assert_eq!(summary.rows_reported, 8);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].table, "bad");
        assert!(summary.failures[0].statement.contains("FROM `bad`"));
        assert_eq!(h.target.queued_task_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_counts_as_loaded() {
        let h = Harness::new(
            FakeSource::new().with_table("orders", 3),
            FakeTarget::new(1),
            &[("orders", 3)],
        )
        .await;
        h.target.fail_probe_for("orders");
        let (summary, _) = h.run(&mut h.manager(1, None)).await;
        assert_eq!(summary.rows_reported, 0);
        assert!(summary.failures.is_empty());
        assert!(h.target.copy_statements().is_empty());
        assert_eq!(h.target.queued_task_count(), 0);
    }
}
