//! Configuration management for Crosspost

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::logging::LogFormat;
use crate::platforms::ContentRules;

/// Longest wait before any retry, and the largest accepted `retry_base_delay`
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub tracker: TrackerConfig,
    pub logging: LogConfig,
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often the execution loop wakes up
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Maximum number of tasks executing at once
    pub max_concurrent: usize,
    /// Retries allowed per task after the first attempt
    pub retry_limit: u32,
    /// Retry n waits `retry_base_delay * n`
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Finished tasks kept for status lookups
    pub finished_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            max_concurrent: 3,
            retry_limit: 3,
            retry_base_delay: Duration::from_secs(60),
            finished_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub history_capacity: usize,
    /// Number of recent durations averaged per platform
    pub duration_window: usize,
    #[serde(with = "humantime_serde")]
    pub stats_ttl: Duration,
    /// Buffer of the process-wide event broadcast
    pub event_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            duration_window: 50,
            stats_ttl: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

/// An external command acting as a platform adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub supports_login: bool,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub rules: ContentRules,
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file at the default location yields the default
    /// configuration; an explicit `CROSSPOST_CONFIG` must exist.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("CROSSPOST_CONFIG").is_ok();
        let config_path = resolve_config_path()?;
        if !explicit && !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        for platform in &mut config.platforms {
            platform.command = shellexpand::tilde(&platform.command).to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent == 0 {
            return Err(invalid("queue.max_concurrent", "must be at least 1"));
        }
        if self.queue.tick_interval.is_zero() {
            return Err(invalid("queue.tick_interval", "must be greater than zero"));
        }
        if self.queue.retry_base_delay > MAX_RETRY_DELAY {
            return Err(invalid("queue.retry_base_delay", "must be at most 7 days"));
        }
        if self.tracker.history_capacity == 0 {
            return Err(invalid("tracker.history_capacity", "must be at least 1"));
        }
        if self.tracker.duration_window == 0 {
            return Err(invalid("tracker.duration_window", "must be at least 1"));
        }
        if self.tracker.event_capacity == 0 {
            return Err(invalid("tracker.event_capacity", "must be at least 1"));
        }

        let mut seen = std::collections::HashSet::new();
        for platform in &self.platforms {
            if platform.id.trim().is_empty() {
                return Err(ConfigError::MissingField("platforms.id".to_string()).into());
            }
            if platform.command.trim().is_empty() {
                return Err(
                    ConfigError::MissingField(format!("platforms.{}.command", platform.id)).into(),
                );
            }
            if !seen.insert(platform.id.as_str()) {
                return Err(invalid(
                    "platforms.id",
                    &format!("duplicate platform '{}'", platform.id),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::CrosspostError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following the XDG base directory layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}

/// Serde adapter for human-readable durations ("5s", "2m 30s")
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.queue.max_concurrent, 3);
        assert_eq!(config.queue.retry_limit, 3);
        assert_eq!(config.queue.tick_interval, Duration::from_secs(5));
        assert_eq!(config.queue.retry_base_delay, Duration::from_secs(60));
        assert_eq!(config.tracker.history_capacity, 1000);
        assert_eq!(config.tracker.duration_window, 50);
        assert!(config.platforms.is_empty());
    }

    #[test]
    fn test_parse_full_document() {
        let config = Config::parse(
            r#"
[queue]
tick_interval = "250ms"
max_concurrent = 5
retry_limit = 2
retry_base_delay = "1m 30s"

[tracker]
stats_ttl = "10s"

[logging]
format = "json"
level = "debug"

[[platforms]]
id = "toutiao"
name = "Toutiao"
command = "/usr/bin/toutiao-publish"
args = ["--draft"]
timeout = "2m"
features = ["article", "video"]

[platforms.rules]
require_title = true
max_title_chars = 30
"#,
        )
        .unwrap();

        assert_eq!(config.queue.tick_interval, Duration::from_millis(250));
        assert_eq!(config.queue.max_concurrent, 5);
        assert_eq!(config.queue.retry_base_delay, Duration::from_secs(90));
        assert_eq!(config.tracker.stats_ttl, Duration::from_secs(10));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.platforms.len(), 1);

        let platform = &config.platforms[0];
        assert_eq!(platform.id, "toutiao");
        assert_eq!(platform.timeout, Some(Duration::from_secs(120)));
        assert!(!platform.supports_login);
        assert!(platform.rules.require_title);
        assert_eq!(platform.rules.max_title_chars, Some(30));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = Config::parse("[queue]\nmax_concurrent = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue.max_concurrent"));
    }

    #[test]
    fn test_rejects_bad_duration() {
        assert!(Config::parse("[queue]\ntick_interval = \"soon\"\n").is_err());
    }

    #[test]
    fn test_rejects_huge_retry_base_delay() {
        let err = Config::parse("[queue]\nretry_base_delay = \"100000000years\"\n").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("queue.retry_base_delay"));

        let config = Config::parse("[queue]\nretry_base_delay = \"7days\"\n").unwrap();
        assert_eq!(config.queue.retry_base_delay, MAX_RETRY_DELAY);
    }

    #[test]
    fn test_rejects_duplicate_platforms() {
        let err = Config::parse(
            r#"
[[platforms]]
id = "a"
command = "true"

[[platforms]]
id = "a"
command = "false"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate platform 'a'"));
    }

    #[test]
    #[serial]
    fn test_config_env_override() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        std::fs::write(&path, "[queue]\nretry_limit = 7\n").unwrap();

        std::env::set_var("CROSSPOST_CONFIG", path.to_str().unwrap());
        let resolved = resolve_config_path().unwrap();
        let config = Config::load();
        std::env::remove_var("CROSSPOST_CONFIG");

        assert_eq!(resolved, path);
        assert_eq!(config.unwrap().queue.retry_limit, 7);
    }

    #[test]
    #[serial]
    fn test_explicit_missing_config_is_an_error() {
        std::env::set_var("CROSSPOST_CONFIG", "/nonexistent/crosspost/config.toml");
        let result = Config::load();
        std::env::remove_var("CROSSPOST_CONFIG");

        assert!(result.is_err());
    }
}
