use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};

use crate::uar::domain::runs::RunRecord;
use crate::uar::domain::session::SessionRecord;
use crate::uar::persistence::migrations::{AppliedMigration, MigrationRegistry, SchemaTable};
use crate::uar::persistence::{RunStore, guard_overwrite};

#[derive(Debug, Serialize, Deserialize)]
struct SchemaVersion {
    table: SchemaTable,
    version: u32,
}

/// A run row. `created_ms` gives history queries an ordering that string
/// timestamps with varying fractional digits do not.
#[derive(Debug, Serialize)]
struct StoredRun {
    #[serde(flatten)]
    run: RunRecord,
    created_ms: i64,
}

#[derive(Debug)]
pub struct SurrealRunStore {
    db: Surreal<Any>,
}

impl SurrealRunStore {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let db = connect(connection_string).await?;
        db.use_ns("uar").use_db("uar").await?;
        Ok(Self { db })
    }

    /// The underlying client, e.g. to share it with the cancellation registry.
    pub fn client(&self) -> Surreal<Any> {
        self.db.clone()
    }
}

#[async_trait]
impl RunStore for SurrealRunStore {
    async fn read_or_create_session(&self, fresh: SessionRecord) -> Result<SessionRecord> {
        let existing: Option<SessionRecord> =
            self.db.select(("sessions", fresh.session_id.as_str())).await?;
        if let Some(session) = existing {
            return Ok(session);
        }
        let _: Option<SessionRecord> = self
            .db
            .upsert(("sessions", fresh.session_id.as_str()))
            .content(fresh.clone())
            .await?;
        Ok(fresh)
    }

    async fn save_session(&self, session: &SessionRecord) -> Result<()> {
        let _: Option<SessionRecord> = self
            .db
            .upsert(("sessions", session.session_id.as_str()))
            .content(session.clone())
            .await?;
        Ok(())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let existing = self.load_run(&run.run_id).await?;
        guard_overwrite(existing.as_ref(), run)?;
        let row = StoredRun {
            created_ms: run.created_at.timestamp_millis(),
            run: run.clone(),
        };
        let _: Option<RunRecord> = self
            .db
            .upsert(("runs", run.run_id.as_str()))
            .content(row)
            .await?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run: Option<RunRecord> = self.db.select(("runs", run_id)).await?;
        Ok(run)
    }

    async fn list_session_runs(&self, session_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let sql = "SELECT * FROM runs WHERE session_id = $session_id \
                   ORDER BY created_ms DESC LIMIT $limit";
        let mut response = self
            .db
            .query(sql)
            .bind(("session_id", session_id.to_string()))
            .bind(("limit", limit))
            .await?
            .check()?;
        let mut runs: Vec<RunRecord> = response.take(0)?;
        runs.reverse();
        Ok(runs)
    }

    async fn apply_migrations(&self, registry: &MigrationRegistry) -> Result<Vec<AppliedMigration>> {
        self.db
            .query("DEFINE TABLE IF NOT EXISTS schema_versions SCHEMALESS;")
            .await?
            .check()?;

        let mut applied = Vec::new();
        for table in registry.tables() {
            let current: Option<SchemaVersion> =
                self.db.select(("schema_versions", table.as_str())).await?;
            for migration in registry.pending(table, current.map(|c| c.version)) {
                let mut query = self.db.query("BEGIN TRANSACTION;");
                for statement in &migration.statements {
                    query = query.query(statement.as_str());
                }
                query
                    .query("UPSERT type::thing('schema_versions', $table) CONTENT { table: $table, version: $version };")
                    .query("COMMIT TRANSACTION;")
                    .bind(("table", table.as_str()))
                    .bind(("version", migration.version))
                    .await?
                    .check()?;
                tracing::info!(
                    table = table.as_str(),
                    version = migration.version,
                    description = %migration.description,
                    "Applied migration"
                );
                applied.push(AppliedMigration {
                    table,
                    version: migration.version,
                });
            }
        }
        Ok(applied)
    }
}
