use std::path::Path;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Persistence provider (memory, surrealdb, none)
    #[arg(long, env = "PERSISTENCE_PROVIDER")]
    pub persistence_provider: Option<String>,

    /// Cancellation backend (memory, surrealdb)
    #[arg(long, env = "CANCELLATION_BACKEND")]
    pub cancellation_backend: Option<String>,

    /// Default run timeout in seconds (0 disables)
    #[arg(long, env = "RUN_TIMEOUT_SECS")]
    pub run_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub cancellation: CancellationConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Applied to runs that do not set their own timeout; 0 disables.
    pub default_timeout_secs: u64,
    /// How often a paused run re-checks cancellation and its deadline.
    pub pause_poll_millis: u64,
    /// Evaluation budget per expression; 0 disables the limit.
    pub expression_fuel: u64,
    /// Frames buffered per WebSocket subscriber before backpressure.
    pub event_channel_capacity: usize,
    /// How long a finished run's event log stays available for replay; 0 keeps it forever.
    pub event_retention_secs: u64,
    /// Directory scanned for workflow definitions at startup.
    pub workflows_dir: Option<String>,
}

impl RuntimeConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }

    pub fn event_retention(&self) -> Option<Duration> {
        (self.event_retention_secs > 0).then(|| Duration::from_secs(self.event_retention_secs))
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_millis.max(1))
    }

    pub fn fuel(&self) -> Option<u64> {
        (self.expression_fuel > 0).then_some(self.expression_fuel)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CancellationConfig {
    /// `memory` or `surrealdb`.
    pub backend: String,
    pub url: Option<String>,
    /// Entries expire this long after their last write.
    pub entry_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// `memory`, `surrealdb` or `none`.
    pub provider: String,
    pub database_url: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("runtime.default_timeout_secs", 600)?
            .set_default("runtime.pause_poll_millis", 250)?
            .set_default("runtime.expression_fuel", 50_000)?
            .set_default("runtime.event_channel_capacity", 256)?
            .set_default("runtime.event_retention_secs", 3600)?
            .set_default("cancellation.backend", "memory")?
            .set_default("cancellation.entry_ttl_secs", 86_400)?
            .set_default("persistence.provider", "memory")?
            .set_default("persistence.database_url", "mem://")?;

        // Explicit file must exist; the implicit one is optional.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None if Path::new("config.yaml").exists() => {
                builder.add_source(File::with_name("config.yaml").required(false))
            }
            None => builder,
        };

        // E.g. UAR_SERVER__PORT=8000, UAR_CANCELLATION__URL=ws://db:8000
        builder = builder.add_source(
            Environment::with_prefix("UAR")
                .separator("__")
                .try_parsing(true),
        );

        // CLI flags (and their plain env vars) win over everything else.
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(provider) = cli.persistence_provider {
            builder = builder.set_override("persistence.provider", provider)?;
        }
        if let Some(backend) = cli.cancellation_backend {
            builder = builder.set_override("cancellation.backend", backend)?;
        }
        if let Some(timeout) = cli.run_timeout_secs {
            builder = builder.set_override("runtime.default_timeout_secs", timeout)?;
        }

        builder.build()?.try_deserialize()
    }
}
