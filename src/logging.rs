//! Logging setup: stderr always, plus optional rolling files and journald.
//!
//! Log level can be controlled via the `PHOTOINDEX_LOG` environment variable:
//! - `PHOTOINDEX_LOG=debug` for verbose output
//! - `PHOTOINDEX_LOG=info` for standard output (default)
//! - `PHOTOINDEX_LOG=photoindex::tasks=trace` for per-module filters

use anyhow::Result;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Initialize the global subscriber. `verbose` raises the default level to debug.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_env("PHOTOINDEX_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(fmt::layer().with_writer(std::io::stderr).with_target(false).boxed());

    if let Some(ref log_dir) = config.file_dir {
        std::fs::create_dir_all(log_dir)?;

        let file_appender = tracing_appender::rolling::daily(log_dir, "photoindex.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // The guard flushes on drop, so it has to live as long as the process.
        static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
            std::sync::OnceLock::new();
        let _ = GUARD.set(guard);

        layers.push(fmt::layer().with_writer(non_blocking).with_ansi(false).boxed());
    }

    #[cfg(target_os = "linux")]
    {
        if config.journald {
            match tracing_journald::layer() {
                Ok(journald_layer) => layers.push(journald_layer.boxed()),
                Err(e) => eprintln!("journald unavailable, continuing without it: {}", e),
            }
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    tracing::debug!(file_dir = ?config.file_dir, journald = config.journald, "Logging initialized");
    Ok(())
}
