//! Reader role: source rows to CSV chunks.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::core::traits::SourceReader;
use crate::error::{MigrateError, Result};
use crate::pipeline::DataTask;
use crate::transfer::csv::CsvEncoder;
use crate::transfer::TransferSettings;

/// Bytes accumulated before a chunk is handed to the writer.
const CHUNK_BYTES: usize = 64 * 1024;

/// Stream one task's rows into the pipe.
///
/// Waits for the writer's start signal; a dropped signal means the task was
/// skipped and no source query is issued. Errors are forwarded through the
/// pipe so the writer can abort its load.
pub(crate) async fn run_reader<S: SourceReader>(
    task: Arc<DataTask>,
    source: Arc<S>,
    settings: Arc<TransferSettings>,
    start: oneshot::Receiver<()>,
    pipe: mpsc::Sender<Result<Bytes>>,
) {
    if start.await.is_err() {
        debug!("{}: reader not started", task.table_name);
        return;
    }

    let sql = match task.read_statement() {
        Ok(sql) => sql,
        Err(e) => {
            let _ = pipe.send(Err(e)).await;
            return;
        }
    };

    let mut encoder = CsvEncoder::new(settings.delimiter);
    if !task.destination_column_list.is_empty() {
        encoder = encoder.with_width(&task.table_name, task.destination_column_list.len());
    }

    let mut rows = source.stream_query(sql, settings.fetch_batch_size);
    let mut buf = BytesMut::with_capacity(CHUNK_BYTES);
    let mut total = 0u64;

    while let Some(batch) = rows.recv().await {
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                let _ = pipe.send(Err(as_transfer(&task, e))).await;
                return;
            }
        };

        for row in &batch.rows {
            if let Err(e) = encoder.encode_row(row, &mut buf) {
                let _ = pipe.send(Err(e)).await;
                return;
            }
        }
        total += batch.len() as u64;

        if buf.len() >= CHUNK_BYTES && pipe.send(Ok(buf.split().freeze())).await.is_err() {
            // Writer is gone
            return;
        }
    }

    if !buf.is_empty() {
        let _ = pipe.send(Ok(buf.freeze())).await;
    }
    debug!("{}: read {} rows", task.table_name, total);
}

fn as_transfer(task: &DataTask, e: MigrateError) -> MigrateError {
    match e {
        MigrateError::Transfer { .. } => e,
        other => MigrateError::transfer(&task.table_name, other.to_string()),
    }
}
