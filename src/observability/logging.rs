//! Subscriber setup and the operator traffic log.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber (stdout + optional file)
//! - Format the one-line-per-exchange console output
//! - Keep log level configurable via config and `RUST_LOG`

use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::stats::model::RequestRecord;

/// Error type for logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
    #[error("failed to open log file: {0}")]
    LogFile(#[from] std::io::Error),
}

/// Initialize the global subscriber.
///
/// Returns the appender guard when a log file is configured; the caller
/// must keep it alive for the process lifetime or buffered lines are lost.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>, LoggingError> {
    let level = parse_level(level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("forward_proxy={level}")));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            Ok(None)
        }
    }
}

fn parse_level(level: &str) -> Result<Level, LoggingError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(LoggingError::InvalidLevel(other.to_string())),
    }
}

/// Operator-facing traffic log.
///
/// Constructed once at startup and passed by handle into the relays and
/// the stats reporter. Emits through `tracing`, so lines land on stdout
/// and in the log file alongside the structured diagnostics.
#[derive(Debug, Default)]
pub struct TrafficLog;

impl TrafficLog {
    pub fn new() -> Self {
        Self
    }

    /// Emit one message at the given level.
    pub fn record(&self, level: Level, message: &str) {
        if level == Level::ERROR {
            tracing::error!("{message}");
        } else if level == Level::WARN {
            tracing::warn!("{message}");
        } else if level == Level::INFO {
            tracing::info!("{message}");
        } else if level == Level::DEBUG {
            tracing::debug!("{message}");
        } else {
            tracing::trace!("{message}");
        }
    }

    /// One line per completed exchange, success at info, failure at warn.
    pub fn request(&self, record: &RequestRecord) {
        match &record.error {
            Some(error) => self.record(
                Level::WARN,
                &format!("{} {} - ERROR: {}", record.method, record.url, error),
            ),
            None => self.record(
                Level::INFO,
                &format!(
                    "{} {} - {} ({} bytes, {}ms)",
                    record.method,
                    record.url,
                    record.status_code.map_or_else(|| "-".to_string(), |s| s.to_string()),
                    record.response_size,
                    record.duration_ms
                ),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_accepts_known_names() {
        assert_eq!(parse_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert!(parse_level("loud").is_err());
    }
}
