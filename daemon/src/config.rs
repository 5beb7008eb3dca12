use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use orchestrator::{BridgeConfig, RecoveryConfig, WatchdogConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    /// agent id -> terminal session name
    pub agents: HashMap<String, String>,
    pub task: TaskSettings,
    pub bridge: BridgeSettings,
    pub recovery: RecoverySettings,
    pub watchdog: WatchdogSettings,
    pub bus: BusSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Optional database URL. If not provided, defaults under the data home
    pub url: Option<String>,
    /// Maximum number of database connections in the pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TaskSettings {
    pub default_timeout_seconds: u64,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeSettings {
    pub capture_poll_ms: u64,
    pub stable_samples: u32,
    pub inter_line_ms: u64,
    /// Error signature regexes; empty means the built-in set
    pub error_signatures: Vec<String>,
    pub prompt_regex: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecoverySettings {
    pub stale_task_seconds: u64,
    pub stale_execution_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchdogSettings {
    pub default_timeout_seconds: u64,
    pub tick_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BusSettings {
    pub subject_separator: String,
}

impl Config {
    /// Load configuration from built-in defaults, an optional CONFIG_FILE,
    /// and MAESTRO_-prefixed environment variables.
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder.add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(
                File::with_name(&config_file)
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("MAESTRO")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Load configuration from a specific file path, still honoring
    /// environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("MAESTRO")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .context("Failed to build configuration from file")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration from file")?;

        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Apply standard environment variables (DATABASE_URL, LOG_LEVEL) for
    /// compatibility with common deployment patterns.
    fn apply_standard_env_vars(config: &mut Config) {
        if let Ok(database_url) = env::var("DATABASE_URL") {
            config.database.url = Some(database_url);
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.logging.level = log_level;
        }
    }

    /// Get the database URL, with a data-home fallback.
    pub fn database_url(&self) -> String {
        match &self.database.url {
            Some(url) => url.clone(),
            None => Self::default_database_url(),
        }
    }

    /// Default database location: XDG data home when available, then HOME.
    pub fn default_database_url() -> String {
        if let Ok(xdg_data) = env::var("XDG_DATA_HOME") {
            return format!("sqlite://{xdg_data}/maestro/state.db");
        }
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        format!("sqlite://{home}/.maestro/state.db")
    }

    /// Bridge protocol settings as the orchestrator's config type.
    pub fn bridge_config(&self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        BridgeConfig {
            capture_poll: Duration::from_millis(self.bridge.capture_poll_ms),
            stable_samples: self.bridge.stable_samples,
            inter_line_pause: Duration::from_millis(self.bridge.inter_line_ms),
            error_signatures: if self.bridge.error_signatures.is_empty() {
                defaults.error_signatures.clone()
            } else {
                self.bridge.error_signatures.clone()
            },
            prompt_pattern: self.bridge.prompt_regex.clone(),
            backoff_base_secs: self.task.backoff_base_seconds,
            backoff_cap_secs: self.task.backoff_cap_seconds,
            ..defaults
        }
    }

    /// Recovery thresholds and the agent/session topology.
    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            agents: self.agents.clone(),
            stale_task_secs: self.recovery.stale_task_seconds,
            stale_execution_secs: self.recovery.stale_execution_seconds,
        }
    }

    /// Watchdog timing.
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            default_timeout: Duration::from_secs(self.watchdog.default_timeout_seconds),
            tick: Duration::from_secs(self.watchdog.tick_seconds),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ));
            }
        }

        let database_url = self.database_url();
        if !database_url.starts_with("sqlite://") && !database_url.starts_with(":memory:") {
            return Err(anyhow::anyhow!(
                "Only SQLite databases are supported. URL must start with 'sqlite://'. Got: {}",
                database_url
            ));
        }

        if self.agents.is_empty() {
            return Err(anyhow::anyhow!("At least one agent must be configured"));
        }
        for (agent, session) in &self.agents {
            if agent.trim().is_empty() || session.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "Agent ids and session names cannot be empty"
                ));
            }
        }

        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!(
                "Database max_connections must be greater than 0"
            ));
        }
        if self.task.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "task.default_timeout_seconds must be greater than 0"
            ));
        }
        if self.watchdog.tick_seconds == 0 {
            return Err(anyhow::anyhow!(
                "watchdog.tick_seconds must be greater than 0"
            ));
        }
        if self.bus.subject_separator.chars().count() != 1 {
            return Err(anyhow::anyhow!(
                "bus.subject_separator must be a single character"
            ));
        }

        Ok(())
    }

    /// The configured subject separator character.
    pub fn subject_separator(&self) -> char {
        self.bus.subject_separator.chars().next().unwrap_or(':')
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
                connection_timeout: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            agents: [("supervisor".to_string(), "claude-supervisor".to_string())].into(),
            task: TaskSettings {
                default_timeout_seconds: 300,
                max_attempts: 3,
                backoff_base_seconds: 2,
                backoff_cap_seconds: 30,
            },
            bridge: BridgeSettings {
                capture_poll_ms: 500,
                stable_samples: 3,
                inter_line_ms: 200,
                error_signatures: Vec::new(),
                prompt_regex: r"^\w+@\S+\s*[#$]".to_string(),
            },
            recovery: RecoverySettings {
                stale_task_seconds: 300,
                stale_execution_seconds: 600,
            },
            watchdog: WatchdogSettings {
                default_timeout_seconds: 90,
                tick_seconds: 5,
            },
            bus: BusSettings {
                subject_separator: ":".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task.default_timeout_seconds, 300);
        assert_eq!(config.watchdog.default_timeout_seconds, 90);
        assert_eq!(config.subject_separator(), ':');
    }

    #[test]
    fn test_database_url_fallback() {
        let config = Config::default();
        let url = config.database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.contains("state.db"));

        let mut custom = Config::default();
        custom.database.url = Some("sqlite://custom.db".to_string());
        assert_eq!(custom.database_url(), "sqlite://custom.db");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agents.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.url = Some("postgres://nope".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.subject_separator = "::".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bridge_config_uses_builtin_signatures_when_empty() {
        let config = Config::default();
        let bridge = config.bridge_config();
        assert!(!bridge.error_signatures.is_empty());
        assert_eq!(bridge.capture_poll, Duration::from_millis(500));
        assert_eq!(bridge.stable_samples, 3);
        assert_eq!(bridge.backoff_cap_secs, 30);

        let mut custom = Config::default();
        custom.bridge.error_signatures = vec!["panic!".to_string()];
        assert_eq!(custom.bridge_config().error_signatures, vec!["panic!"]);
    }

    #[test]
    fn test_embedded_defaults_parse() {
        // The embedded default.toml must stay deserializable
        let config = Config::from_env().unwrap();
        assert!(config.agents.contains_key("supervisor"));
        assert!(config.validate().is_ok());
    }
}
