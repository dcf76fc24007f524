use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use super::CancellationBackend;

#[derive(Debug, Clone, Copy)]
struct Entry {
    cancelled: bool,
    expires_at: Option<Instant>,
}

/// Single-process backend. One lock guards the whole map, which makes every
/// operation atomic per run id.
#[derive(Debug, Default)]
pub struct InMemoryCancellation {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Option<Duration>,
}

impl InMemoryCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries expire `ttl` after their last write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
        entries
    }

    fn expiry(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl CancellationBackend for InMemoryCancellation {
    async fn register_run(&self, run_id: &str) -> Result<()> {
        let expires_at = self.expiry();
        self.entries()
            .entry(run_id.to_string())
            .or_insert(Entry {
                cancelled: false,
                expires_at,
            });
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        let expires_at = self.expiry();
        let previous = self.entries().insert(
            run_id.to_string(),
            Entry {
                cancelled: true,
                expires_at,
            },
        );
        Ok(previous.is_some())
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        Ok(self.entries().get(run_id).is_some_and(|e| e.cancelled))
    }

    async fn cleanup_run(&self, run_id: &str) -> Result<()> {
        self.entries().remove(run_id);
        Ok(())
    }

    async fn get_active_runs(&self) -> Result<HashMap<String, bool>> {
        Ok(self
            .entries()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.cancelled))
            .collect())
    }
}
