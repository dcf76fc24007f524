use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};

use super::CancellationBackend;

const TABLE_DEFINITION: &str = "DEFINE TABLE IF NOT EXISTS run_cancellation SCHEMALESS;";

#[derive(Debug, Deserialize)]
struct EntryRow {
    cancelled: bool,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct ActiveRow {
    run_id: String,
    cancelled: bool,
}

/// Shared backend on SurrealDB so every process sees the same intent.
///
/// Each entry carries an `expires_at` (epoch millis) refreshed on write;
/// expired entries are treated as absent and purged lazily, which lets
/// entries of crashed processes heal on their own.
#[derive(Debug)]
pub struct SurrealCancellation {
    db: Surreal<Any>,
    ttl: Duration,
}

impl SurrealCancellation {
    pub async fn connect(connection_string: &str, ttl: Duration) -> Result<Self> {
        let db = connect(connection_string).await?;
        db.use_ns("uar").use_db("uar").await?;
        Self::from_client(db, ttl).await
    }

    /// Reuse an existing client (e.g. the one the run store opened).
    pub async fn from_client(db: Surreal<Any>, ttl: Duration) -> Result<Self> {
        db.query(TABLE_DEFINITION).await?.check()?;
        Ok(Self { db, ttl })
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn expires_at(&self) -> i64 {
        let ttl = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        Self::now_millis().saturating_add(ttl)
    }
}

#[async_trait]
impl CancellationBackend for SurrealCancellation {
    async fn register_run(&self, run_id: &str) -> Result<()> {
        // INSERT IGNORE leaves an existing (possibly cancelled) entry alone.
        let sql = "
            DELETE type::thing('run_cancellation', $run_id) WHERE expires_at <= $now;
            INSERT IGNORE INTO run_cancellation { id: $run_id, cancelled: false, expires_at: $expires_at };
        ";
        self.db
            .query(sql)
            .bind(("run_id", run_id.to_string()))
            .bind(("now", Self::now_millis()))
            .bind(("expires_at", self.expires_at()))
            .await?
            .check()?;
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        // A single UPSERT is atomic; RETURN BEFORE tells us what it replaced.
        let sql = "UPSERT type::thing('run_cancellation', $run_id) \
                   SET cancelled = true, expires_at = $expires_at RETURN BEFORE;";
        let mut response = self
            .db
            .query(sql)
            .bind(("run_id", run_id.to_string()))
            .bind(("expires_at", self.expires_at()))
            .await?
            .check()?;
        let previous: Option<EntryRow> = response.take(0)?;
        let now = Self::now_millis();
        Ok(previous.is_some_and(|row| row.expires_at > now))
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        let sql = "SELECT cancelled, expires_at FROM type::thing('run_cancellation', $run_id);";
        let mut response = self
            .db
            .query(sql)
            .bind(("run_id", run_id.to_string()))
            .await?
            .check()?;
        let rows: Vec<EntryRow> = response.take(0)?;
        let now = Self::now_millis();
        Ok(rows.iter().any(|row| row.cancelled && row.expires_at > now))
    }

    async fn cleanup_run(&self, run_id: &str) -> Result<()> {
        self.db
            .query("DELETE type::thing('run_cancellation', $run_id);")
            .bind(("run_id", run_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_active_runs(&self) -> Result<HashMap<String, bool>> {
        let sql = "SELECT record::id(id) AS run_id, cancelled FROM run_cancellation \
                   WHERE expires_at > $now;";
        let mut response = self
            .db
            .query(sql)
            .bind(("now", Self::now_millis()))
            .await?
            .check()?;
        let rows: Vec<ActiveRow> = response.take(0)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.run_id, row.cancelled))
            .collect())
    }
}
