//! PostgreSQL destination pool and session.
//!
//! Uses deadpool-postgres for connection pooling and text COPY for loads.
//! Every statement a worker pair issues goes through the one pooled client
//! it checked out.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::core::identifier::{qualify_pg, quote_literal};
use crate::core::traits::{TargetPool, TargetSession};
use crate::drivers::common::SslMode;
use crate::error::{MigrateError, Result};
use crate::queue::QueueTable;
use crate::state::{Phase, PhaseTable};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL destination pool.
pub struct PgTarget {
    pool: Pool,
    max_size: usize,
}

impl PgTarget {
    /// Create the pool and check that a connection can be made.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match SslMode::parse(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?;

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            max_size: max_conns,
        })
    }
}

#[async_trait]
impl TargetPool for PgTarget {
    type Session = PgSession;

    async fn session(&self) -> Result<PgSession> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "acquiring PostgreSQL session"))?;
        Ok(PgSession { client })
    }

    fn max_size(&self) -> usize {
        self.max_size
    }
}

/// One pooled PostgreSQL client, returned to the pool on drop.
pub struct PgSession {
    client: Object,
}

fn set_role_sql(mode: &str) -> String {
    format!("SET session_replication_role = {}", quote_literal(mode))
}

#[async_trait]
impl TargetSession for PgSession {
    async fn create_queue(&mut self, queue: &QueueTable) -> Result<()> {
        self.client.batch_execute(&queue.create_sql()?).await?;
        Ok(())
    }

    async fn insert_task(&mut self, queue: &QueueTable, payload: &str) -> Result<i64> {
        let row = self
            .client
            .query_one(&queue.insert_sql()?, &[&payload])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn load_tasks(&mut self, queue: &QueueTable) -> Result<Vec<(i64, String)>> {
        let rows = self.client.query(&queue.select_sql()?, &[]).await?;
        rows.iter()
            .map(|row| -> Result<(i64, String)> { Ok((row.try_get(0)?, row.try_get(1)?)) })
            .collect()
    }

    async fn finish_task(
        &mut self,
        queue: &QueueTable,
        id: i64,
        restore_trigger_mode: Option<&str>,
    ) -> Result<()> {
        let mut sql = queue.delete_sql(id)?;
        if let Some(mode) = restore_trigger_mode {
            sql.push_str("; ");
            sql.push_str(&set_role_sql(mode));
        }
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn clear_queue(&mut self, queue: &QueueTable) -> Result<()> {
        self.client.batch_execute(&queue.clear_sql()?).await?;
        Ok(())
    }

    async fn drop_queue(&mut self, queue: &QueueTable) -> Result<()> {
        self.client.batch_execute(&queue.drop_sql()?).await?;
        Ok(())
    }

    async fn create_phase_table(&mut self, table: &PhaseTable) -> Result<()> {
        self.client.batch_execute(&table.create_sql()?).await?;
        Ok(())
    }

    async fn read_phase(&mut self, table: &PhaseTable, phase: Phase) -> Result<bool> {
        let row = self.client.query_one(&table.select_sql(phase)?, &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn mark_phases(&mut self, table: &PhaseTable, phases: &[Phase]) -> Result<()> {
        if phases.is_empty() {
            return Ok(());
        }
        self.client.execute(&table.update_sql(phases)?, &[]).await?;
        Ok(())
    }

    async fn drop_phase_table(&mut self, table: &PhaseTable) -> Result<()> {
        self.client.batch_execute(&table.drop_sql()?).await?;
        Ok(())
    }

    async fn table_has_rows(&mut self, schema: &str, table: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} LIMIT 1", qualify_pg(schema, table)?);
        Ok(self.client.query_opt(&sql, &[]).await?.is_some())
    }

    async fn trigger_mode(&mut self) -> Result<String> {
        let row = self
            .client
            .query_one("SELECT current_setting('session_replication_role')", &[])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn set_trigger_mode(&mut self, mode: &str) -> Result<()> {
        debug!("session_replication_role -> {}", mode);
        self.client.batch_execute(&set_role_sql(mode)).await?;
        Ok(())
    }

    async fn copy_in(
        &mut self,
        statement: &str,
        mut data: mpsc::Receiver<Result<Bytes>>,
    ) -> Result<u64> {
        let sink = self.client.copy_in(statement).await?;
        futures::pin_mut!(sink);

        // Returning early drops the sink unfinished, which aborts the COPY
        while let Some(chunk) = data.recv().await {
            sink.send(chunk?).await?;
        }

        let copied = sink.finish().await?;
        Ok(copied)
    }

    async fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn discard(self) {
        // Detached from the pool, the connection closes when dropped
        drop(Object::take(self.client));
    }
}
