//! TOML configuration loading.
//!
//! Three sections are recognized: `[db]` (connection string and
//! database name), `[logger]` (enabled level list and backtrace
//! capture), and `[indexCfg]` (headers-first mode). Any unrecognized
//! key anywhere is a startup failure, so typos never silently fall
//! back to defaults.

use std::path::Path;

use serde::Deserialize;
use tracing::level_filters::LevelFilter;

/// Malformed or unknown-keyed configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown log level `{0}`; expected error, warn, info, debug, or the single element `all`")]
    InvalidLevel(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default, rename = "indexCfg")]
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    /// MongoDB connection string.
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Enabled levels: `error`, `warn`, `info`, `debug`, or `["all"]`.
    #[serde(default = "all_levels")]
    pub level: Vec<String>,
    #[serde(default)]
    pub log_backtrace_enabled: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: all_levels(),
            log_backtrace_enabled: false,
        }
    }
}

fn all_levels() -> Vec<String> {
    vec!["all".to_owned()]
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// true enables headers-first download.
    #[serde(default, rename = "mode")]
    pub headers_first: bool,
}

/// Load and validate the configuration file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = toml::from_str(&raw)?;
    // Validate the level list up front so a bad logger section fails
    // startup instead of the first log call.
    tracing_filter(&config.logger.level)?;
    Ok(config)
}

/// Map the configured level list onto a `tracing` max-level filter.
pub fn tracing_filter(levels: &[String]) -> Result<LevelFilter, ConfigError> {
    if levels.len() == 1 && levels[0] == "all" {
        return Ok(LevelFilter::DEBUG);
    }
    let mut filter = LevelFilter::OFF;
    for level in levels {
        let candidate = match level.as_str() {
            "error" => LevelFilter::ERROR,
            "warn" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            other => return Err(ConfigError::InvalidLevel(other.to_owned())),
        };
        if candidate > filter {
            filter = candidate;
        }
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str::<Config>(raw)?)
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
            [db]
            uri = "mongodb://127.0.0.1:27017"
            database = "magpie"

            [logger]
            level = ["info", "error"]
            log_backtrace_enabled = true

            [indexCfg]
            mode = true
            "#,
        )
        .expect("config parses");

        assert_eq!(config.db.database, "magpie");
        assert!(config.logger.log_backtrace_enabled);
        assert!(config.index.headers_first);
        assert_eq!(
            tracing_filter(&config.logger.level).expect("levels are valid"),
            LevelFilter::INFO
        );
    }

    #[test]
    fn unknown_keys_fail_startup() {
        let err = parse(
            r#"
            [db]
            uri = "mongodb://127.0.0.1:27017"
            database = "magpie"
            flush_interval = 5
            "#,
        )
        .expect_err("unknown key must be rejected");
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = parse(
            r#"
            [db]
            uri = "mongodb://127.0.0.1:27017"
            database = "magpie"

            [cache]
            size = 10
            "#,
        )
        .expect_err("unknown section must be rejected");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_optional_sections_use_zero_values() {
        let config = parse(
            r#"
            [db]
            uri = "mongodb://127.0.0.1:27017"
            database = "magpie"
            "#,
        )
        .expect("config parses");

        assert!(!config.index.headers_first);
        assert_eq!(config.logger.level, vec!["all".to_owned()]);
        assert!(!config.logger.log_backtrace_enabled);
    }

    #[test]
    fn all_enables_every_level() {
        let filter = tracing_filter(&["all".to_owned()]).expect("all is valid");
        assert_eq!(filter, LevelFilter::DEBUG);
    }

    #[test]
    fn invalid_level_is_rejected() {
        let err = tracing_filter(&["verbose".to_owned()]).expect_err("must reject");
        assert!(matches!(err, ConfigError::InvalidLevel(level) if level == "verbose"));

        // `all` mixed with other levels is also invalid.
        let err = tracing_filter(&["all".to_owned(), "info".to_owned()])
            .expect_err("mixed `all` must be rejected");
        assert!(matches!(err, ConfigError::InvalidLevel(_)));
    }

    #[test]
    fn filter_takes_the_most_verbose_level() {
        let filter =
            tracing_filter(&["error".to_owned(), "debug".to_owned()]).expect("levels are valid");
        assert_eq!(filter, LevelFilter::DEBUG);
    }

    #[test]
    fn empty_level_list_disables_logging() {
        let filter = tracing_filter(&[]).expect("empty list is valid");
        assert_eq!(filter, LevelFilter::OFF);
    }
}
