//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "kairos-live.log";

/// `RUST_LOG` when set, otherwise the configured filter.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
}

/// Install the global subscriber: human-readable output on stderr, plus a
/// daily-rotated file when `log_dir` is set.
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed. A second call is a no-op.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().with_ansi(false).with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter(config))
                .with(stderr)
                .with(file)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter(config))
                .with(stderr)
                .try_init();
            None
        }
    }
}
