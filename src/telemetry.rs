use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "treenq=info,tower_http=info";
const LOG_FILE_PREFIX: &str = "treenq.log";

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Daily rolling files in this directory instead of stdout.
    pub dir: Option<PathBuf>,
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered lines are lost on exit.
pub fn init(config: &LogConfig) -> WorkerGuard {
    let (writer, guard) = match &config.dir {
        Some(dir) => {
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(config.dir.is_none()),
            )
            .init();
    }
    guard
}
