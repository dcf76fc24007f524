//! Universal Agent Runtime orchestrator
//!
//! Executes runs of agents, teams and multi-step workflows from dispatch to a
//! terminal state, with cooperative cancellation that also works across
//! processes and an event log clients can replay after reconnecting.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP API with SSE and WebSocket streaming
//! - **Run Manager**: dispatch modes, lifecycle state machine, pause/resume
//! - **Step Engine**: sequences, loops, routers and conditions over sandboxed expressions
//! - **Cancellation Registry**: in-memory or SurrealDB-backed shared intent store
//!
//! # Modules
//!
//! - [`config`]: layered configuration (defaults, file, env, CLI)
//! - [`error`]: the fault taxonomy surfaced to callers
//! - [`uar`]: domain, runtime, persistence and API

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod server;
pub mod uar;

use crate::config::AppConfig;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use uar::runtime::manager::RunManager;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Run Manager
    pub run_manager: Arc<RunManager>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Prometheus exposition, absent when no recorder was installed
    pub metrics: Option<PrometheusHandle>,
}
