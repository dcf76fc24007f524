use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::PersistenceConfig;
use crate::uar::domain::runs::RunRecord;
use crate::uar::domain::session::SessionRecord;

pub mod migrations;
pub mod providers;

use migrations::{AppliedMigration, MigrationRegistry};

/// Durable storage the run manager needs; nothing more.
#[async_trait]
pub trait RunStore: Send + Sync + std::fmt::Debug {
    // =========================================================================
    // Sessions
    // =========================================================================

    /// Load the session with `fresh.session_id`, or store `fresh` and return it.
    async fn read_or_create_session(&self, fresh: SessionRecord) -> Result<SessionRecord>;

    async fn save_session(&self, session: &SessionRecord) -> Result<()>;

    // =========================================================================
    // Runs
    // =========================================================================

    /// Insert or replace a run. Rewriting a terminal run's outcome is refused.
    async fn save_run(&self, run: &RunRecord) -> Result<()>;

    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// The latest `limit` runs of a session, oldest first.
    async fn list_session_runs(&self, session_id: &str, limit: usize) -> Result<Vec<RunRecord>>;

    // =========================================================================
    // Schema
    // =========================================================================

    async fn apply_migrations(&self, registry: &MigrationRegistry) -> Result<Vec<AppliedMigration>>;
}

/// Refuse to replace a terminal record with a different outcome.
pub(crate) fn guard_overwrite(existing: Option<&RunRecord>, next: &RunRecord) -> Result<()> {
    if let Some(existing) = existing {
        existing.check_overwrite(next)?;
    }
    Ok(())
}

/// Open the store selected in configuration, with bundled migrations applied.
/// `none` disables persistence.
pub async fn connect(config: &PersistenceConfig) -> Result<Option<Arc<dyn RunStore>>> {
    let store: Arc<dyn RunStore> = match config.provider.as_str() {
        "none" => return Ok(None),
        "memory" => Arc::new(providers::memory::MemoryRunStore::new()),
        "surrealdb" => Arc::new(providers::surreal::SurrealRunStore::new(&config.database_url).await?),
        other => anyhow::bail!("unknown persistence provider '{other}'"),
    };
    let applied = store.apply_migrations(&MigrationRegistry::defaults()).await?;
    tracing::info!(
        provider = %config.provider,
        migrations_applied = applied.len(),
        "Run store ready"
    );
    Ok(Some(store))
}
