//! Tracing subscriber setup for applications embedding the engine
//!
//! The library itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`init_logging`] once at startup. `RUST_LOG`
//! overrides the default level when set.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{WalletError, WalletResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for local development
    Pretty,
    /// JSON lines for log aggregation
    Json,
}

impl LogFormat {
    /// "json" selects JSON, anything else is pretty
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(default_level: &str, format: LogFormat) -> WalletResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init(),
    };
    result.map_err(|e| {
        WalletError::ConfigurationError(format!("Failed to initialise logging: {e}"))
    })?;

    tracing::info!("logging initialized (format={:?})", format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_is_lenient() {
        assert_eq!(LogFormat::from_str_lossy("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_str_lossy("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str_lossy("whatever"), LogFormat::Pretty);
    }

    #[test]
    fn second_initialisation_is_an_error() {
        let _ = init_logging("debug", LogFormat::Pretty);
        assert!(init_logging("debug", LogFormat::Json).is_err());
    }
}
