//! Logging setup for embedders and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the host process.

use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive, e.g. `"gpu_state_heap=debug"`.
    pub level: String,
    /// Logs go to stderr when unset.
    pub output_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            output_path: None,
        }
    }
}

impl LogConfig {
    /// Reads `GSH_LOG_FORMAT` (`json`/`pretty`), `GSH_LOG` and `GSH_LOG_FILE`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(fmt) = std::env::var("GSH_LOG_FORMAT")
            && fmt.eq_ignore_ascii_case("pretty")
        {
            config.format = LogFormat::Pretty;
        }
        if let Ok(level) = std::env::var("GSH_LOG") {
            config.level = level;
        }
        config.output_path = std::env::var_os("GSH_LOG_FILE").map(PathBuf::from);
        config
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Failed to open log file: {0}")]
    FileOpen(String),
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
}

/// Installs the global subscriber. Call once.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter =
        EnvFilter::try_new(&config.level).map_err(|e| LogError::InvalidFilter(e.to_string()))?;
    let registry = tracing_subscriber::registry().with(filter);

    match (config.format, &config.output_path) {
        (LogFormat::Json, Some(path)) => {
            let file =
                std::fs::File::create(path).map_err(|e| LogError::FileOpen(e.to_string()))?;
            registry
                .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
                .try_init()
        }
        (LogFormat::Json, None) => registry.with(fmt::layer().json()).try_init(),
        (LogFormat::Pretty, _) => registry.with(fmt::layer().pretty()).try_init(),
    }
    .map_err(|_| LogError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_filter() {
        let config = LogConfig {
            level: "gpu_state_heap=notalevel".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(LogError::InvalidFilter(_))
        ));
    }
}
