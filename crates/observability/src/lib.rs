//! Structured logging initialization.
//!
//! One function, called once at process startup by whatever embeds the
//! engine: a CLI binary, a test harness, or a host service. Everything
//! downstream just uses the `tracing` macros.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging verbosity, independent of target-specific filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default verbosity for the `tokenizer` target family.
    pub level: LogLevel,
    /// Emit newline-delimited JSON instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            json: false,
        }
    }
}

/// Install a global `tracing` subscriber built from `config`.
///
/// `RUST_LOG` overrides `config.level` entirely when set, following the
/// usual `tracing-subscriber` convention. Must be called at most once per
/// process; a second call returns an error rather than panicking.
pub fn init_logging(config: &LoggingConfig) -> eyre::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,tokenizer={}", config.level)));

    let fmt_layer = fmt::layer().with_target(true);
    let fmt_layer = if config.json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| eyre::eyre!("logging already initialized: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_display_matches_tracing_directive_syntax() {
        assert_eq!(LogLevel::Debug.to_string(), "debug");
    }

    #[test]
    fn default_config_is_info_and_human_readable() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert!(!config.json);
    }
}
