//! Logging setup
//!
//! Installs a layered `tracing` subscriber:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else the configured level)
//!   └── Fmt Layer (plain text or JSON)
//! ```
//!
//! Host applications that already install their own subscriber simply skip
//! this; the engine only emits `tracing` events and spans.
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_fanout::config::LoggingConfig;
//! use mizuchi_fanout::telemetry;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggingConfig {
//!     level: "debug".to_string(),
//!     json: true,
//! };
//! telemetry::init(&config)?;
//! # Ok(())
//! # }
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Subscriber setup errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Filter from RUST_LOG, falling back to `level`
pub fn env_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| TelemetryError::InvalidFilter(e.to_string())),
    }
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(&config.level)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()
    };

    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}
