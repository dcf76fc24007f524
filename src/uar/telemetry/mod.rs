use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize application telemetry (logging and tracing).
///
/// - `EnvFilter` reads `RUST_LOG`, defaulting to `info` with debug output
///   for this crate.
/// - `UAR_LOG_FORMAT=json` switches from the compact format to JSON lines.
pub fn init() {
    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,uar_orchestrator=debug"));

    let json = std::env::var("UAR_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter_layer);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Install the process-wide Prometheus recorder.
///
/// The returned handle renders the exposition text served at `/metrics`.
pub fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::describe_counter!("uar_runs_dispatched_total", "Runs accepted for execution");
    metrics::describe_counter!("uar_runs_finished_total", "Runs that reached a terminal state");
    metrics::describe_histogram!(
        "uar_run_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time from dispatch to terminal state"
    );
    Ok(handle)
}
