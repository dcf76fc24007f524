use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::uar::domain::runs::RunRecord;
use crate::uar::domain::session::SessionRecord;
use crate::uar::persistence::migrations::{AppliedMigration, MigrationRegistry, SchemaTable};
use crate::uar::persistence::{RunStore, guard_overwrite};

/// Process-local store, for tests and single-node deployments without a database.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    runs: RwLock<HashMap<String, RunRecord>>,
    versions: RwLock<HashMap<SchemaTable, u32>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn read_or_create_session(&self, fresh: SessionRecord) -> Result<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(fresh.session_id.clone())
            .or_insert(fresh)
            .clone())
    }

    async fn save_session(&self, session: &SessionRecord) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let mut runs = self.runs.write().await;
        guard_overwrite(runs.get(&run.run_id), run)?;
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_session_runs(&self, session_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<RunRecord> = runs
            .values()
            .filter(|r| r.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }

    async fn apply_migrations(&self, registry: &MigrationRegistry) -> Result<Vec<AppliedMigration>> {
        let mut versions = self.versions.write().await;
        let mut applied = Vec::new();
        for table in registry.tables() {
            for migration in registry.pending(table, versions.get(&table).copied()) {
                versions.insert(table, migration.version);
                applied.push(AppliedMigration {
                    table,
                    version: migration.version,
                });
            }
        }
        Ok(applied)
    }
}
