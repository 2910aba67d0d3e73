//! Tracing subscriber setup
//!
//! Everything is written to stderr. Stdout carries the JSON-lines protocol
//! of `crosspost-send` and must stay clean.
//!
//! ```no_run
//! use libcrosspost::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "libcrosspost=debug", false).init();
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const FORMAT_VAR: &str = "CROSSPOST_LOG_FORMAT";
const LEVEL_VAR: &str = "CROSSPOST_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain single-line records
    Text,
    /// One JSON object per record
    Json,
    /// Multi-line, colored
    Pretty,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [LogFormat::Text, LogFormat::Json, LogFormat::Pretty]
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "Invalid log format: '{}'. Valid options: text, json, pretty",
                    s
                )
            })
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved logging settings
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level name or any `EnvFilter` directive
    pub level: String,
    /// Force `debug` unless `RUST_LOG` says otherwise
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>, verbose: bool) -> Self {
        Self {
            format,
            level: level.into(),
            verbose,
        }
    }

    /// Settings from the `[logging]` table, with `CROSSPOST_LOG_FORMAT` and
    /// `CROSSPOST_LOG_LEVEL` taking precedence
    ///
    /// An unparseable `CROSSPOST_LOG_FORMAT` is ignored.
    pub fn from_config(table: &LogConfig, verbose: bool) -> Self {
        let format = std::env::var(FORMAT_VAR)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(table.format);
        let level = std::env::var(LEVEL_VAR).unwrap_or_else(|_| table.level.clone());
        Self::new(format, level, verbose)
    }

    fn filter(&self) -> EnvFilter {
        let fallback = if self.verbose { "debug" } else { self.level.as_str() };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    }

    /// Install the global subscriber
    ///
    /// Only the first call in a process takes effect.
    pub fn init(&self) {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(self.filter())
            .with_writer(std::io::stderr);

        let installed = match self.format {
            LogFormat::Text => builder.with_target(false).try_init(),
            LogFormat::Json => builder
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_file(true)
                .with_line_number(true)
                .try_init(),
            LogFormat::Pretty => builder.pretty().with_file(true).with_line_number(true).try_init(),
        };

        if installed.is_err() {
            tracing::debug!(format = %self.format, "Subscriber already installed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("Invalid log format: 'xml'"));
    }

    #[test]
    fn test_display_matches_config_spelling() {
        for format in [LogFormat::Text, LogFormat::Json, LogFormat::Pretty] {
            assert_eq!(format.to_string().parse::<LogFormat>().unwrap(), format);
        }
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
    }

    #[test]
    #[serial]
    fn test_env_overrides_config_table() {
        std::env::set_var(FORMAT_VAR, "json");
        std::env::set_var(LEVEL_VAR, "trace");
        let config = LoggingConfig::from_config(&LogConfig::default(), false);
        std::env::remove_var(FORMAT_VAR);
        std::env::remove_var(LEVEL_VAR);

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "trace");
    }

    #[test]
    #[serial]
    fn test_bad_env_format_falls_back_to_table() {
        std::env::set_var(FORMAT_VAR, "xml");
        std::env::remove_var(LEVEL_VAR);
        let table = LogConfig {
            format: LogFormat::Pretty,
            level: "warn".to_string(),
        };
        let config = LoggingConfig::from_config(&table, true);
        std::env::remove_var(FORMAT_VAR);

        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.level, "warn");
        assert!(config.verbose);
    }
}
