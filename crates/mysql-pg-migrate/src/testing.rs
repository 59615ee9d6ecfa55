//! In-memory source, target and DDL hooks for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};

use crate::core::schema::{Column, Table};
use crate::core::traits::{SchemaHooks, SourceReader, TargetPool, TargetSession};
use crate::core::value::{Batch, SqlValue};
use crate::error::{MigrateError, Result};
use crate::queue::QueueTable;
use crate::state::{Phase, PhaseTable};
use crate::transfer::REPLICA_MODE;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Table name from `COPY "schema"."table" ...`.
fn copy_target(statement: &str) -> String {
    statement.split('"').nth(3).unwrap_or_default().to_string()
}

/// Table name from `SELECT ... FROM `table``.
fn read_source(sql: &str) -> String {
    sql.rsplit("FROM `")
        .next()
        .unwrap_or_default()
        .trim_end_matches('`')
        .to_string()
}

#[derive(Default)]
struct TargetState {
    queue: Option<BTreeMap<i64, String>>,
    next_id: i64,
    phases: Option<HashMap<Phase, bool>>,
    rows: HashMap<String, u64>,
    copies: Vec<String>,
    probes: usize,
    fail_copy: HashSet<String>,
    fail_probe: HashSet<String>,
    fail_queue_creation: bool,
    fail_trigger_restore: bool,
    discarded_sessions: usize,
    released_modes: Vec<String>,
    active_sessions: usize,
    peak_sessions: usize,
    events: Vec<String>,
}

/// Destination double with a bounded session pool.
pub struct FakeTarget {
    state: Arc<Mutex<TargetState>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl FakeTarget {
    pub fn new(size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TargetState::default())),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn with_rows(self, table: &str, rows: u64) -> Self {
        lock(&self.state).rows.insert(table.to_string(), rows);
        self
    }

    pub fn fail_copy_for(&self, table: &str) {
        lock(&self.state).fail_copy.insert(table.to_string());
    }

    pub fn fail_probe_for(&self, table: &str) {
        lock(&self.state).fail_probe.insert(table.to_string());
    }

    pub fn fail_queue_creation(&self) {
        lock(&self.state).fail_queue_creation = true;
    }

    /// Make every trigger-mode change other than disabling fail.
    pub fn fail_trigger_restore(&self) {
        lock(&self.state).fail_trigger_restore = true;
    }

    /// Sessions closed instead of returned to the pool.
    pub fn discarded_sessions(&self) -> usize {
        lock(&self.state).discarded_sessions
    }

    pub fn rows_in(&self, table: &str) -> u64 {
        lock(&self.state).rows.get(table).copied().unwrap_or(0)
    }

    pub fn queued_task_count(&self) -> usize {
        lock(&self.state).queue.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    pub fn queue_exists(&self) -> bool {
        lock(&self.state).queue.is_some()
    }

    pub fn phase_table_exists(&self) -> bool {
        lock(&self.state).phases.is_some()
    }

    pub fn copy_statements(&self) -> Vec<String> {
        lock(&self.state).copies.clone()
    }

    pub fn probe_count(&self) -> usize {
        lock(&self.state).probes
    }

    /// Trigger mode of every session at the moment it was released.
    pub fn released_modes(&self) -> Vec<String> {
        lock(&self.state).released_modes.clone()
    }

    pub fn peak_sessions(&self) -> usize {
        lock(&self.state).peak_sessions
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.state).events.clone()
    }

    /// Set phase flags directly, as a previous run would have.
    pub async fn preset_phases(&self, phases: &[Phase]) {
        let mut state = lock(&self.state);
        let flags = state
            .phases
            .get_or_insert_with(|| Phase::ALL.iter().map(|p| (*p, false)).collect());
        for phase in phases {
            flags.insert(*phase, true);
        }
    }
}

#[async_trait]
impl TargetPool for FakeTarget {
    type Session = FakeSession;

    async fn session(&self) -> Result<FakeSession> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MigrateError::pool(e, "fake pool closed"))?;
        {
            let mut state = lock(&self.state);
            state.active_sessions += 1;
            state.peak_sessions = state.peak_sessions.max(state.active_sessions);
        }
        Ok(FakeSession {
            state: self.state.clone(),
            trigger_mode: "origin".to_string(),
            discarded: false,
            _permit: permit,
        })
    }

    fn max_size(&self) -> usize {
        self.size
    }
}

pub struct FakeSession {
    state: Arc<Mutex<TargetState>>,
    trigger_mode: String,
    discarded: bool,
    _permit: OwnedSemaphorePermit,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.active_sessions -= 1;
        if self.discarded {
            state.discarded_sessions += 1;
        } else {
            state.released_modes.push(self.trigger_mode.clone());
        }
    }
}

fn missing(what: &str) -> MigrateError {
    MigrateError::State(format!("relation {} does not exist", what))
}

#[async_trait]
impl TargetSession for FakeSession {
    async fn create_queue(&mut self, _queue: &QueueTable) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_queue_creation {
            return Err(MigrateError::pool("permission denied", "create queue"));
        }
        state.queue.get_or_insert_with(BTreeMap::new);
        Ok(())
    }

    async fn insert_task(&mut self, queue: &QueueTable, payload: &str) -> Result<i64> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state
            .queue
            .as_mut()
            .ok_or_else(|| missing(queue.name()))?
            .insert(id, payload.to_string());
        Ok(id)
    }

    async fn load_tasks(&mut self, queue: &QueueTable) -> Result<Vec<(i64, String)>> {
        let state = lock(&self.state);
        let rows = state.queue.as_ref().ok_or_else(|| missing(queue.name()))?;
        Ok(rows.iter().map(|(id, p)| (*id, p.clone())).collect())
    }

    async fn finish_task(
        &mut self,
        queue: &QueueTable,
        id: i64,
        restore_trigger_mode: Option<&str>,
    ) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state
                .queue
                .as_mut()
                .ok_or_else(|| missing(queue.name()))?
                .remove(&id);
            state.events.push(format!("dequeue:{}", id));
        }
        if let Some(mode) = restore_trigger_mode {
            lock(&self.state).events.push(format!("restore:{}", mode));
            self.trigger_mode = mode.to_string();
        }
        Ok(())
    }

    async fn clear_queue(&mut self, queue: &QueueTable) -> Result<()> {
        lock(&self.state)
            .queue
            .as_mut()
            .ok_or_else(|| missing(queue.name()))?
            .clear();
        Ok(())
    }

    async fn drop_queue(&mut self, _queue: &QueueTable) -> Result<()> {
        lock(&self.state).queue = None;
        Ok(())
    }

    async fn create_phase_table(&mut self, _table: &PhaseTable) -> Result<()> {
        lock(&self.state)
            .phases
            .get_or_insert_with(|| Phase::ALL.iter().map(|p| (*p, false)).collect());
        Ok(())
    }

    async fn read_phase(&mut self, table: &PhaseTable, phase: Phase) -> Result<bool> {
        let state = lock(&self.state);
        let flags = state.phases.as_ref().ok_or_else(|| missing(table.name()))?;
        Ok(flags.get(&phase).copied().unwrap_or(false))
    }

    async fn mark_phases(&mut self, table: &PhaseTable, phases: &[Phase]) -> Result<()> {
        let mut state = lock(&self.state);
        let flags = state.phases.as_mut().ok_or_else(|| missing(table.name()))?;
        for phase in phases {
            flags.insert(*phase, true);
        }
        Ok(())
    }

    async fn drop_phase_table(&mut self, _table: &PhaseTable) -> Result<()> {
        lock(&self.state).phases = None;
        Ok(())
    }

    async fn table_has_rows(&mut self, _schema: &str, table: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        state.probes += 1;
        if state.fail_probe.contains(table) {
            return Err(MigrateError::pool("connection reset", "probe"));
        }
        Ok(state.rows.get(table).copied().unwrap_or(0) > 0)
    }

    async fn trigger_mode(&mut self) -> Result<String> {
        Ok(self.trigger_mode.clone())
    }

    async fn set_trigger_mode(&mut self, mode: &str) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.fail_trigger_restore && mode != REPLICA_MODE {
                return Err(MigrateError::pool("connection reset", "set trigger mode"));
            }
            state.events.push(format!("trigger:{}", mode));
        }
        self.trigger_mode = mode.to_string();
        Ok(())
    }

    async fn copy_in(
        &mut self,
        statement: &str,
        mut data: mpsc::Receiver<Result<Bytes>>,
    ) -> Result<u64> {
        let table = copy_target(statement);
        let fail = {
            let mut state = lock(&self.state);
            state.copies.push(statement.to_string());
            state.fail_copy.contains(&table)
        };

        let mut rows = 0u64;
        while let Some(chunk) = data.recv().await {
            let chunk = chunk?;
            rows += chunk.iter().filter(|b| **b == b'\n').count() as u64;
            if fail {
                return Err(MigrateError::transfer(&table, "simulated COPY failure"));
            }
        }
        if fail {
            return Err(MigrateError::transfer(&table, "simulated COPY failure"));
        }

        let mut state = lock(&self.state);
        *state.rows.entry(table.clone()).or_insert(0) += rows;
        state.events.push(format!("loaded:{}", table));
        Ok(rows)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    fn discard(mut self) {
        self.discarded = true;
    }
}

#[derive(Default)]
struct SourceState {
    tables: Vec<(String, usize)>,
    fail_read: HashSet<String>,
    gates: HashMap<String, Arc<Notify>>,
    queries: Vec<String>,
}

/// Source double producing `(id, label)` rows.
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, rows: usize) -> Self {
        lock(&self.state).tables.push((name.to_string(), rows));
        self
    }

    pub fn fail_read_for(&self, table: &str) {
        lock(&self.state).fail_read.insert(table.to_string());
    }

    /// Hold the table's read until the returned handle is notified.
    pub fn gate(&self, table: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        lock(&self.state)
            .gates
            .insert(table.to_string(), notify.clone());
        notify
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.state).queries.clone()
    }
}

#[async_trait]
impl SourceReader for FakeSource {
    async fn extract_tables(&self, schema: &str) -> Result<Vec<Table>> {
        let state = lock(&self.state);
        Ok(state
            .tables
            .iter()
            .map(|(name, rows)| Table {
                schema: schema.to_string(),
                name: name.clone(),
                columns: vec![Column::new("id", "bigint"), Column::new("label", "varchar")],
                primary_key: vec!["id".to_string()],
                row_count: *rows as i64,
            })
            .collect())
    }

    fn stream_query(&self, sql: String, batch_size: usize) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(2);
        let table = read_source(&sql);
        let (rows, fail, gate) = {
            let mut state = lock(&self.state);
            state.queries.push(sql);
            let rows = state
                .tables
                .iter()
                .find(|(name, _)| *name == table)
                .map(|(_, rows)| *rows)
                .unwrap_or(0);
            (
                rows,
                state.fail_read.contains(&table),
                state.gates.get(&table).cloned(),
            )
        };

        tokio::spawn(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if fail {
                let _ = tx
                    .send(Err(MigrateError::transfer(&table, "simulated read failure")))
                    .await;
                return;
            }
            let mut batch = Vec::new();
            for i in 0..rows {
                batch.push(vec![
                    SqlValue::Int(i as i64),
                    SqlValue::text(&format!("row {}", i)),
                ]);
                if batch.len() == batch_size.max(1) {
                    if tx.send(Ok(Batch::new(std::mem::take(&mut batch)))).await.is_err() {
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx.send(Ok(Batch::new(batch))).await;
            }
        });

        rx
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "fake"
    }
}

/// DDL hooks that record what they were asked to do.
#[derive(Default)]
pub struct RecordingHooks {
    calls: Mutex<Vec<String>>,
    fail_constraints: Mutex<HashSet<String>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn fail_constraints_for(&self, table: &str) {
        lock(&self.fail_constraints).insert(table.to_string());
    }
}

#[async_trait]
impl SchemaHooks for RecordingHooks {
    async fn create_tables(&self, tables: &[Table]) -> Result<()> {
        lock(&self.calls).push(format!("create_tables:{}", tables.len()));
        Ok(())
    }

    async fn load_table_constraints(&self, table: &str) -> Result<()> {
        lock(&self.calls).push(format!("constraints:{}", table));
        if lock(&self.fail_constraints).contains(table) {
            return Err(MigrateError::transfer(table, "simulated constraint failure"));
        }
        Ok(())
    }

    async fn create_foreign_keys(&self) -> Result<()> {
        lock(&self.calls).push("foreign_keys".to_string());
        Ok(())
    }

    async fn create_views(&self) -> Result<()> {
        lock(&self.calls).push("views".to_string());
        Ok(())
    }
}

#[test]
fn test_statement_parsers() {
    assert_eq!(
        copy_target("COPY \"public\".\"orders\" (\"id\") FROM STDIN"),
        "orders"
    );
    assert_eq!(read_source("SELECT `id` FROM `orders`"), "orders");
}
