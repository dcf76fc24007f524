//! Schema versioning for run stores.
//!
//! Migrations are keyed by the table they touch and carry version tags that
//! must strictly increase per table. A store records the last applied version
//! per table and only runs what is newer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RunFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaTable {
    Sessions,
    Runs,
}

impl SchemaTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Runs => "runs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub table: SchemaTable,
    pub version: u32,
    pub description: String,
    /// SurrealQL statements; stores without a schema only track the version.
    pub statements: Vec<String>,
}

impl Migration {
    pub fn new(table: SchemaTable, version: u32, description: impl Into<String>) -> Self {
        Self {
            table,
            version,
            description: description.into(),
            statements: Vec::new(),
        }
    }

    #[must_use]
    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }
}

/// A migration a store has applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub table: SchemaTable,
    pub version: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<SchemaTable, Vec<Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration; its version must exceed every earlier one for the table.
    pub fn register(&mut self, migration: Migration) -> Result<(), RunFault> {
        let entries = self.migrations.entry(migration.table).or_default();
        if let Some(last) = entries.last()
            && migration.version <= last.version
        {
            return Err(RunFault::Validation(format!(
                "migration {} for {} must be newer than {}",
                migration.version,
                migration.table.as_str(),
                last.version
            )));
        }
        entries.push(migration);
        Ok(())
    }

    /// Migrations for `table` newer than `applied`, oldest first.
    pub fn pending(&self, table: SchemaTable, applied: Option<u32>) -> Vec<&Migration> {
        self.migrations
            .get(&table)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|m| applied.is_none_or(|v| m.version > v))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tables(&self) -> impl Iterator<Item = SchemaTable> + '_ {
        self.migrations.keys().copied()
    }

    /// Schema the bundled stores expect.
    pub fn defaults() -> Self {
        let mut registry = Self::new();
        let migrations = [
            Migration::new(SchemaTable::Sessions, 1, "create sessions")
                .statement("DEFINE TABLE IF NOT EXISTS sessions SCHEMALESS;"),
            Migration::new(SchemaTable::Runs, 1, "create runs")
                .statement("DEFINE TABLE IF NOT EXISTS runs SCHEMALESS;")
                .statement("DEFINE INDEX IF NOT EXISTS runs_session ON TABLE runs FIELDS session_id;"),
            Migration::new(SchemaTable::Runs, 2, "index run status")
                .statement("DEFINE INDEX IF NOT EXISTS runs_status ON TABLE runs FIELDS status;"),
            Migration::new(SchemaTable::Runs, 3, "order session history by creation time")
                .statement(
                    "DEFINE INDEX IF NOT EXISTS runs_session_created ON TABLE runs FIELDS session_id, created_ms;",
                ),
        ];
        for migration in migrations {
            // Versions above are strictly increasing per table.
            if let Err(e) = registry.register(migration) {
                tracing::error!(error = %e, "Invalid bundled migration");
            }
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_must_increase_per_table() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(Migration::new(SchemaTable::Runs, 1, "one"))
            .unwrap();
        registry
            .register(Migration::new(SchemaTable::Sessions, 1, "other table"))
            .unwrap();
        assert!(registry
            .register(Migration::new(SchemaTable::Runs, 1, "again"))
            .is_err());
        registry
            .register(Migration::new(SchemaTable::Runs, 4, "skip ahead"))
            .unwrap();
    }

    #[test]
    fn test_pending_skips_applied_versions() {
        let registry = MigrationRegistry::defaults();
        assert_eq!(registry.pending(SchemaTable::Runs, None).len(), 3);
        let pending = registry.pending(SchemaTable::Runs, Some(1));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].version, 2);
        assert!(registry.pending(SchemaTable::Runs, Some(3)).is_empty());
    }
}
