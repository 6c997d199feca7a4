//! Tracing setup for the enhancer binary.
//!
//! `RUST_LOG` takes precedence over the configured level. When a log
//! directory is configured, output is duplicated to a daily rolling file.

use anyhow::{Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use crate::config::EnhancerConfig;

const LOG_FILE_PREFIX: &str = "enhancer.log";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. The returned guard must be held for the
/// life of the process so buffered file output is flushed on exit.
pub fn init_logging(config: &EnhancerConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let logging = &config.toml.logging;
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let json = logging.format == "json";

    let (guard, result) = match config.log_dir() {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow!("Failed to create log directory {}: {}", dir.display(), e))?;
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let writer = std::io::stderr.and(file_writer);
            let result = if json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(env_filter(level))
                    .with_writer(writer)
                    .try_init()
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter(level))
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init()
            };
            (Some(guard), result)
        }
        None => {
            let result = if json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(env_filter(level))
                    .with_writer(std::io::stderr)
                    .try_init()
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter(level))
                    .with_writer(std::io::stderr)
                    .try_init()
            };
            (None, result)
        }
    };

    result.map_err(|e| anyhow!("tracing init failed: {e}"))?;
    Ok(guard)
}
