//! Server configuration: TOML file, then environment, then CLI flags.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use taskpool_core::PoolConfig;

pub const DEFAULT_CONFIG_FILE: &str = "taskpool.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty`, `compact` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Explicit path, else `./taskpool.toml` if present, else defaults.
    /// Environment overrides are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Overrides from any key lookup; unset or empty keys are skipped.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind) = get("TASKPOOL_BIND") {
            self.bind = bind;
        }
        if let Some(size) = get("TASK_QUEUE_SIZE") {
            self.pool.queue_capacity = parse("TASK_QUEUE_SIZE", &size)?;
        }
        if let Some(ttl) = get("TASKPOOL_LEASE_TTL_SECS") {
            self.pool.lease_ttl_secs = parse("TASKPOOL_LEASE_TTL_SECS", &ttl)?;
        }
        if let Some(timeout) = get("TASKPOOL_HEARTBEAT_TIMEOUT_SECS") {
            self.pool.heartbeat_timeout_secs = parse("TASKPOOL_HEARTBEAT_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(attempts) = get("TASKPOOL_MAX_ATTEMPTS") {
            self.pool.max_attempts = parse("TASKPOOL_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(retention) = get("TASKPOOL_TERMINAL_RETENTION_SECS") {
            self.pool.terminal_retention_secs =
                parse("TASKPOOL_TERMINAL_RETENTION_SECS", &retention)?;
        }
        if let Some(level) = get("TASKPOOL_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key}={value:?} is not a valid number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;
    use taskpool_core::DispatchMode;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn toml_sections_fill_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind = "0.0.0.0:9000"

            [pool]
            queue_capacity = 50
            dispatch_mode = "push"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.pool.queue_capacity, 50);
        assert_eq!(config.pool.dispatch_mode, DispatchMode::Push);
        assert_eq!(config.pool.max_attempts, 3);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut config = ServerConfig::default();
        config
            .apply_overrides(lookup(&[
                ("TASK_QUEUE_SIZE", "20"),
                ("TASKPOOL_LEASE_TTL_SECS", "120"),
                ("TASKPOOL_HEARTBEAT_TIMEOUT_SECS", "30"),
                ("TASKPOOL_MAX_ATTEMPTS", "5"),
                ("TASKPOOL_TERMINAL_RETENTION_SECS", "600"),
                ("TASKPOOL_BIND", "0.0.0.0:1234"),
                ("TASKPOOL_LOG_LEVEL", "debug"),
            ]))
            .unwrap();
        assert_eq!(config.pool.queue_capacity, 20);
        assert_eq!(config.pool.lease_ttl_secs, 120);
        assert_eq!(config.pool.heartbeat_timeout_secs, 30);
        assert_eq!(config.pool.max_attempts, 5);
        assert_eq!(config.pool.terminal_retention_secs, 600);
        assert_eq!(config.bind, "0.0.0.0:1234");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn empty_values_are_ignored() {
        let mut config = ServerConfig::default();
        config
            .apply_overrides(lookup(&[("TASK_QUEUE_SIZE", " ")]))
            .unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[rstest]
    #[case("TASK_QUEUE_SIZE", "lots")]
    #[case("TASKPOOL_MAX_ATTEMPTS", "-1")]
    #[case("TASKPOOL_LEASE_TTL_SECS", "1.5")]
    #[case("TASKPOOL_TERMINAL_RETENTION_SECS", "1h")]
    fn malformed_numbers_are_reported(#[case] key: &str, #[case] value: &str) {
        let mut config = ServerConfig::default();
        let err = config.apply_overrides(lookup(&[(key, value)])).unwrap_err();
        assert!(err.to_string().contains(key));
    }

    #[test]
    fn missing_file_has_context() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/taskpool.toml"))).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
