//! Configuration for ironloop.
//!
//! Settings are read from the environment (after loading `.env` via
//! dotenvy). Every component config also has a `Default` so tests and
//! embedders can build one directly.

use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::agent::{AgentConfig, SupervisorConfig};
use crate::bridge::BridgeConfig;
use crate::error::ConfigError;
use crate::safety::ConfirmationConfig;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub agent: AgentConfig,
    pub confirmation: ConfirmationConfig,
    pub supervisor: SupervisorConfig,
    /// `None` selects the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub llm: LlmConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let bridge = BridgeConfig {
            url: optional_env("BRIDGE_URL")?.unwrap_or_else(|| BridgeConfig::default().url),
            secret: optional_env("BRIDGE_SECRET")?.map(SecretString::from),
            auth_timeout: secs_env("BRIDGE_AUTH_TIMEOUT_SECS", 10)?,
            discover_timeout: secs_env("BRIDGE_DISCOVER_TIMEOUT_SECS", 10)?,
            list_tools_timeout: secs_env("BRIDGE_LIST_TOOLS_TIMEOUT_SECS", 15)?,
            call_timeout: secs_env("BRIDGE_CALL_TIMEOUT_SECS", 120)?,
            max_reconnect_attempts: parse_env("BRIDGE_MAX_RECONNECT_ATTEMPTS", 5)?,
            reconnect_base_delay: Duration::from_millis(parse_env(
                "BRIDGE_RECONNECT_BASE_DELAY_MS",
                1000,
            )?),
        };

        let agent = AgentConfig {
            max_iterations: parse_env("AGENT_MAX_ITERATIONS", 20)?,
            quick_max_iterations: parse_env("AGENT_QUICK_MAX_ITERATIONS", 5)?,
            ..AgentConfig::default()
        };

        let confirmation = ConfirmationConfig {
            ttl: positive_secs_env("CONFIRMATION_TTL_SECS", 300)?,
            sweep_interval: positive_secs_env("CONFIRMATION_SWEEP_INTERVAL_SECS", 60)?,
            retention: positive_secs_env("CONFIRMATION_RETENTION_SECS", 3600)?,
        };

        let supervisor = SupervisorConfig {
            heartbeat_interval: positive_secs_env("LOOP_HEARTBEAT_INTERVAL_SECS", 10)?,
            checkpoint_interval: positive_secs_env("LOOP_CHECKPOINT_INTERVAL_SECS", 5)?,
            stale_after: positive_secs_env("LOOP_STALE_AFTER_SECS", 60)?,
            max_recovery_attempts: parse_env("LOOP_MAX_RECOVERY_ATTEMPTS", 3)?,
        };

        let database = match optional_env("DATABASE_URL")? {
            Some(url) => Some(DatabaseConfig {
                url: SecretString::from(url),
                pool_size: parse_env("DATABASE_POOL_SIZE", 10)?,
            }),
            None => None,
        };

        let llm = LlmConfig {
            base_url: optional_env("LLM_BASE_URL")?
                .unwrap_or_else(|| LlmConfig::default().base_url),
            api_key: optional_env("LLM_API_KEY")?.map(SecretString::from),
            model: optional_env("LLM_MODEL")?.unwrap_or_else(|| LlmConfig::default().model),
        };

        Ok(Self {
            bridge,
            agent,
            confirmation,
            supervisor,
            database,
            llm,
        })
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    /// The connection URL. Never log this.
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// Settings for the OpenAI-compatible inference provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Read an environment variable, treating empty values as unset.
fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn secs_env(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    parse_env(key, default_secs).map(Duration::from_secs)
}

/// Like [`secs_env`], but zero is rejected. Used for timer periods.
fn positive_secs_env(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    match optional_env(key)? {
        Some(raw) => positive_secs(key, &raw),
        None => Ok(Duration::from_secs(default_secs)),
    }
}

fn positive_secs(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_value(key, raw)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}': {}", raw, e),
        })
}
