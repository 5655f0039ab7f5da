use color_eyre::{eyre::eyre, Result};
use qcache::config::LogConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives, e.g. `QCACHE_LOG=qcache=debug`.
pub const LOG_ENV: &str = "QCACHE_LOG";

/// Install the global subscriber.
///
/// Logs go to stderr unless `log.file` is set. Keep the returned guard alive
/// until exit so buffered file output is flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log filter {:?}: {}", config.level, e))?;

  let Some(path) = &config.file else {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to install logger: {}", e))?;
    return Ok(None);
  };

  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or(Path::new("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(Some(guard))
}
