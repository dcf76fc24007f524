//! UAR orchestrator server
//!
//! Entry point for the run orchestration service.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use dotenvy::dotenv;
use tracing::{info, warn};

use uar_orchestrator::config::AppConfig;
use uar_orchestrator::server::start_server;
use uar_orchestrator::uar::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    // Initialize tracing (M-LOG-STRUCTURED)
    telemetry::init();

    let config = Arc::new(AppConfig::load()?);
    info!(
        name: "uar.startup",
        version = env!("CARGO_PKG_VERSION"),
        "Starting UAR orchestrator"
    );

    let metrics = match telemetry::install_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable; /metrics disabled");
            None
        }
    };

    start_server(config, metrics).await
}
