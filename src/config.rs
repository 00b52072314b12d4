//! Configuration loading for chatrelay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable that overrides the configured bot token.
pub const TOKEN_ENV: &str = "TELEGRAM_TOKEN";

/// Get the chatrelay home directory (~/.chatrelay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".chatrelay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.chatrelay/settings.json.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        tracing::debug!("Loaded settings from {}", path.display());
        settings
    } else {
        Settings::default()
    };

    settings.apply_env();
    validate_settings(&settings)?;
    Ok(settings)
}

/// Load settings or return default if loading fails.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        let mut settings = Settings::default();
        settings.apply_env();
        settings
    })
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.executor.timeout_secs == 0 {
        return Err(Error::Config(
            "executor.timeout_secs must be greater than zero".to_string(),
        ));
    }
    if settings.agent.register_interval_secs == 0 {
        return Err(Error::Config(
            "agent.register_interval_secs must be greater than zero".to_string(),
        ));
    }
    if settings.executor.sender_env.is_empty() || settings.executor.sender_env.contains('=') {
        return Err(Error::Config(format!(
            "executor.sender_env '{}' is not a valid variable name",
            settings.executor.sender_env
        )));
    }
    Ok(())
}

/// Telegram channel configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
}

/// Hub configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HubConfig {
    pub listen: String,
    pub data_dir: Option<PathBuf>,
    /// Extra names resolving to the same user, keyed by canonical name.
    pub aliases: HashMap<String, Vec<String>>,
    /// Registrations older than this many missed heartbeats are refused.
    pub stale_after_missed: u32,
    pub connect_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8684".to_string(),
            data_dir: None,
            aliases: HashMap::new(),
            stale_after_missed: 3,
            connect_timeout_secs: 10,
        }
    }
}

impl HubConfig {
    /// Resolve the data directory, defaulting to the home directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_home_dir()?.join("data")),
        }
    }
}

/// Agent configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AgentConfig {
    pub name: Option<String>,
    pub upstream: String,
    pub listen: String,
    pub register_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: None,
            upstream: "http://127.0.0.1:8684".to_string(),
            listen: "0.0.0.0:8685".to_string(),
            register_interval_secs: 60,
        }
    }
}

impl AgentConfig {
    pub fn register_interval(&self) -> Duration {
        Duration::from_secs(self.register_interval_secs)
    }
}

/// Script executor configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ExecutorConfig {
    pub base_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub sender_env: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            timeout_secs: 15,
            sender_env: "TBOT_SENDER".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the script directory, defaulting to the working directory.
    pub fn base_dir(&self) -> Result<PathBuf> {
        match &self.base_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}

/// chatrelay settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Settings {
    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.telegram.bot_token = Some(token);
            }
        }
    }

    /// The bot token, or a configuration error naming how to set it.
    pub fn bot_token(&self) -> Result<String> {
        self.telegram
            .bot_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "No Telegram bot token configured; set {} or telegram.bot_token",
                    TOKEN_ENV
                ))
            })
    }

    /// Maximum registration age before an agent counts as stale.
    pub fn stale_after(&self) -> Duration {
        self.agent.register_interval() * self.hub.stale_after_missed.max(1)
    }
}
