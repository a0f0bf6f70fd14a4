use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const LOG_FILE_PREFIX: &str = "mrsync.log";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `config.level`. Output goes to a daily-rotated file when
/// a log directory is configured, otherwise to stderr. Keep the returned guard
/// alive for as long as logs should be flushed.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", config.level, e))?;

  let directory = config.directory();
  let (writer, guard) = match &directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(directory.is_none())
    .with_target(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  match directory {
    Some(dir) => tracing::info!(directory = %dir.display(), "logging initialized"),
    None => tracing::debug!("logging initialized"),
  }
  Ok(guard)
}

