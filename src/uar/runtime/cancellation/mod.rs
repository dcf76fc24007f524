//! Cancellation intent per run, in-process or shared across processes.
//!
//! The contract every backend honours:
//!
//! - `register_run` only creates an entry when none exists, so a cancel issued
//!   before the run started is never overwritten (cancel-before-start).
//! - `cancel_run` always records the intent and reports whether the run had
//!   been registered, as one atomic check-then-set.
//! - `cleanup_run` is idempotent.
//!
//! [`CancellationRegistry`] is the injectable handle the run manager and the
//! step engine share; construct one per process (or per test).

mod memory;
mod surreal;

pub use memory::InMemoryCancellation;
pub use surreal::SurrealCancellation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::CancellationConfig;
use crate::error::RunFault;

#[async_trait]
pub trait CancellationBackend: Send + Sync + std::fmt::Debug {
    async fn register_run(&self, run_id: &str) -> Result<()>;

    /// Record cancellation; returns whether the run had been registered.
    async fn cancel_run(&self, run_id: &str) -> Result<bool>;

    async fn is_cancelled(&self, run_id: &str) -> Result<bool>;

    async fn cleanup_run(&self, run_id: &str) -> Result<()>;

    /// Every live entry and its cancelled flag.
    async fn get_active_runs(&self) -> Result<HashMap<String, bool>>;
}

/// Cheap, cloneable handle over a cancellation backend.
#[derive(Clone, Debug)]
pub struct CancellationRegistry {
    backend: Arc<dyn CancellationBackend>,
}

impl CancellationRegistry {
    pub fn new(backend: Arc<dyn CancellationBackend>) -> Self {
        Self { backend }
    }

    /// Process-local registry without expiry.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCancellation::new()))
    }

    /// Build the backend selected in configuration.
    pub async fn from_config(config: &CancellationConfig) -> Result<Self> {
        let ttl = Duration::from_secs(config.entry_ttl_secs);
        match config.backend.as_str() {
            "surrealdb" => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("cancellation.url is required for surrealdb"))?;
                let backend = SurrealCancellation::connect(url, ttl).await?;
                tracing::info!(url = %url, ttl_secs = config.entry_ttl_secs, "Shared cancellation registry connected");
                Ok(Self::new(Arc::new(backend)))
            }
            "memory" => Ok(Self::new(Arc::new(InMemoryCancellation::with_ttl(ttl)))),
            other => anyhow::bail!("unknown cancellation backend '{other}'"),
        }
    }

    pub async fn register_run(&self, run_id: &str) -> Result<()> {
        self.backend.register_run(run_id).await
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<bool> {
        let was_registered = self.backend.cancel_run(run_id).await?;
        tracing::info!(run_id = %run_id, was_registered, "Run cancellation recorded");
        Ok(was_registered)
    }

    pub async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        self.backend.is_cancelled(run_id).await
    }

    /// Fail with [`RunFault::Cancelled`] when the run has been cancelled.
    pub async fn raise_if_cancelled(&self, run_id: &str) -> std::result::Result<(), RunFault> {
        match self.backend.is_cancelled(run_id).await {
            Ok(true) => Err(RunFault::Cancelled {
                run_id: run_id.to_string(),
            }),
            Ok(false) => Ok(()),
            Err(e) => Err(RunFault::persistence(&e)),
        }
    }

    pub async fn cleanup_run(&self, run_id: &str) -> Result<()> {
        self.backend.cleanup_run(run_id).await
    }

    pub async fn get_active_runs(&self) -> Result<HashMap<String, bool>> {
        self.backend.get_active_runs().await
    }
}
