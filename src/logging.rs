use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes logging with console output and, when enabled, a daily-rolling
/// JSON file. `RUST_LOG` directives are honored on top of the default filter.
pub fn init_logging(config: &LoggingConfig) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(&config.default_filter),
    };

    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = if config.file_output && fs::create_dir_all(&config.dir).is_ok() {
        let file_appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
        // The guard flushes on drop; keep it for the life of the process
        std::mem::forget(guard);
        Some(fmt::layer().json().with_writer(non_blocking_writer))
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();
}
