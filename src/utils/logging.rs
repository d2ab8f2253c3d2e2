use crate::models::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Console output plus a daily-rolling JSON log file. The returned guard
/// flushes the file writer on drop and must live as long as `main`.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("creating log directory {}", config.directory))?;

    let file_appender = tracing_appender::rolling::daily(&config.directory, "fleet-monitor.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=warn,hyper=warn", config.level))),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .json(),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    info!("Logging initialized (level {}, files in {})", config.level, config.directory);
    Ok(guard)
}
