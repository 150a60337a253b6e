//! Telemetry for the tern file mesh
//!
//! Installs a `tracing` subscriber with an env-driven filter and a pretty,
//! compact or JSON formatter.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};

use thiserror::Error;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Invalid logging configuration
    #[error("Logging error: {0}")]
    Logging(String),

    /// Subscriber installation failed
    #[error("Initialization error: {0}")]
    Init(String),

    /// Log file could not be opened
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
