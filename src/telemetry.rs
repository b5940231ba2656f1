//! Logging setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  fmt,
  layer::{Layer, SubscriberExt},
  util::SubscriberInitExt,
  EnvFilter,
};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. When a log file is configured
/// the returned guard must be held until exit so buffered lines are flushed.
pub fn init(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&logging.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", logging.level, e))?;

  let (fmt_layer, guard) = match &logging.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();
      (layer, Some(guard))
    }
    None => {
      let layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed();
      (layer, None)
    }
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
