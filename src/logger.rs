use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Installs the global subscriber. `ARMONITE_LOG`/`RUST_LOG` override the
/// configured level; format and file destination come from the config.
pub fn init_logging(config: &LoggingConfig) {
    let filter = std::env::var("ARMONITE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map_or_else(
            |_| EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info")),
            |value| EnvFilter::try_new(value).unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let file = config.file.as_deref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(Arc::new(file)),
            Err(err) => {
                eprintln!("Failed to open log file {}: {}", path, err);
                None
            }
        }
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match (config.format, file) {
        (LogFormat::Text, None) => builder.try_init(),
        (LogFormat::Json, None) => builder.json().try_init(),
        (LogFormat::Text, Some(file)) => builder
            .with_ansi(false)
            .with_writer(move || Arc::clone(&file))
            .try_init(),
        (LogFormat::Json, Some(file)) => builder
            .json()
            .with_writer(move || Arc::clone(&file))
            .try_init(),
    };

    if let Err(err) = result {
        eprintln!("Failed to set global default subscriber: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
