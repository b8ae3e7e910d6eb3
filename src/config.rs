use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ChatError;

/// Environment variable consulted when the configured one is unset
const FALLBACK_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the OpenAI-compatible endpoint
    pub base_url: String,

    /// Model id sent with every request
    pub model: String,

    /// Environment variable holding the bearer credential
    pub api_key_env: String,

    /// Credential stored in config.toml; the environment wins when both exist
    pub api_key: Option<String>,

    /// Stream responses instead of waiting for the full answer
    pub stream: bool,

    /// Prompt template used when none is chosen explicitly
    pub default_template: String,

    /// Ask the model for a short title after the first exchange
    pub auto_title: bool,

    /// Upper bound on each wait for the endpoint (connect, headers, each chunk)
    pub request_timeout_secs: u64,

    /// Where conversations and prompts live
    pub data_dir: PathBuf,

    pub retry: RetryConfig,

    pub throttle: ThrottleConfig,
}

/// Retry policy for the completion endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after every failure
    pub base_delay_ms: u64,
}

/// Display throttling for streamed output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Emit once this many new characters have arrived
    pub min_chars: usize,
    /// Emit once this much time passed since the previous update
    pub max_interval_ms: u64,
    /// Emit right away when a delta is sentence-ending punctuation
    pub flush_on_punctuation: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_chars: 5,
            max_interval_ms: 30,
            flush_on_punctuation: true,
        }
    }
}

impl ThrottleConfig {
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));

        Config {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            api_key: None,
            stream: true,
            default_template: "default".to_string(),
            auto_title: true,
            request_timeout_secs: 120,
            data_dir: home.join(".parley"),
            retry: RetryConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl Config {
    /// Load `~/.parley/config.toml`, falling back to defaults
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        let parley_home = home.join(".parley");

        fs::create_dir_all(&parley_home)
            .context("Failed to create .parley directory")?;

        let config_path = parley_home.join("config.toml");
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Config {
                data_dir: parley_home,
                ..Config::default()
            })
        }
    }

    /// Load a specific config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Save configuration to `<data_dir>/config.toml`
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .context("Failed to create data directory")?;
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        fs::write(self.data_dir.join("config.toml"), content)
            .context("Failed to write config file")?;
        Ok(())
    }

    /// Resolve the bearer credential. Called once at startup.
    pub fn resolve_api_key(&self) -> Result<String, ChatError> {
        let present = |key: &String| !key.trim().is_empty();
        std::env::var(&self.api_key_env)
            .ok()
            .filter(present)
            .or_else(|| self.api_key.clone().filter(present))
            .or_else(|| std::env::var(FALLBACK_API_KEY_ENV).ok().filter(present))
            .ok_or_else(|| {
                ChatError::Configuration(format!(
                    "no API key found; set {} or api_key in config.toml",
                    self.api_key_env
                ))
            })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    pub fn prompts_file(&self) -> PathBuf {
        self.data_dir.join("prompt.json")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.data_dir.join("prompts")
    }
}
