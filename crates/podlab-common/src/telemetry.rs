//! Logging initialization for test binaries
//!
//! Installs a `tracing` subscriber with an `EnvFilter` and either
//! human-readable or JSON output. Test harnesses call this once; later calls
//! report [`TelemetryError::SubscriberInit`] instead of panicking.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,podlab=debug,kube=warn,tower=warn,hyper=warn";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format for log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Configuration for logging initialization
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Filter directive; `RUST_LOG` wins when set
    pub filter: String,
    /// Output format
    pub format: LogFormat,
    /// Write through the test harness capture instead of stdout
    pub test_writer: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::default(),
            test_writer: true,
        }
    }
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match (config.format, config.test_writer) {
        (LogFormat::Json, true) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_test_writer(),
            )
            .try_init(),
        (LogFormat::Json, false) => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        (LogFormat::Pretty, true) => registry
            .with(tracing_subscriber::fmt::layer().compact().with_test_writer())
            .try_init(),
        (LogFormat::Pretty, false) => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_reported() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let err = init_logging(LogConfig {
            filter: "podlab=notalevel".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, TelemetryError::Filter(_)));
    }

    #[test]
    fn second_init_fails_instead_of_panicking() {
        let _ = init_logging(LogConfig::default());
        let err = init_logging(LogConfig::default()).unwrap_err();
        assert!(matches!(err, TelemetryError::SubscriberInit(_)));
    }
}
