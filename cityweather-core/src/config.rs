use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

use crate::{model::UserId, retry::RetryConfig};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

pub const ENV_STORE_URL: &str = "CITYWEATHER_STORE_URL";
pub const ENV_API_KEY: &str = "CITYWEATHER_API_KEY";
pub const ENV_USER_ID: &str = "CITYWEATHER_USER_ID";

/// Connection details for the hosted record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Project base URL, e.g. "https://xyz.supabase.co".
    pub url: String,
    /// Public (anon) API key.
    pub api_key: String,
    /// Session access token issued at sign-in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// The signed-in user on whose behalf favorites are read and written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: crate::retry::DEFAULT_MAX_RETRIES,
            initial_delay_ms: crate::retry::DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: crate::retry::DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// request_timeout_secs = 10
///
/// [store]
/// url = "https://xyz.supabase.co"
/// api_key = "..."
///
/// [session]
/// user_id = "..."
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: None,
            session: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    /// Load config from disk (or defaults if absent), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            // First run: no config file, start empty.
            Self::default()
        };

        cfg.apply_overrides(|name| std::env::var(name).ok());
        Ok(cfg)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "cityweather", "cityweather")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Override fields from variables resolved by `lookup` (the process environment in `load`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let url = lookup(ENV_STORE_URL);
        let key = lookup(ENV_API_KEY);

        if let Some(store) = self.store.as_mut() {
            if let Some(url) = url {
                store.url = url;
            }
            if let Some(key) = key {
                store.api_key = key;
            }
        } else if let (Some(url), Some(api_key)) = (url, key) {
            self.store = Some(StoreConfig { url, api_key, access_token: None });
        }

        if let Some(user_id) = lookup(ENV_USER_ID) {
            self.session = Some(SessionConfig { user_id });
        }
    }

    pub fn store_config(&self) -> Result<&StoreConfig> {
        self.store.as_ref().ok_or_else(|| {
            anyhow!(
                "No record store configured.\n\
                 Hint: run `cityweather configure` and enter your project URL and API key."
            )
        })
    }

    pub fn set_store(&mut self, url: String, api_key: String) {
        let access_token = self.store.take().and_then(|s| s.access_token);
        self.store = Some(StoreConfig { url, api_key, access_token });
    }

    /// The signed-in user, or a hint to configure one.
    pub fn user_id(&self) -> Result<UserId> {
        self.session
            .as_ref()
            .map(|s| UserId::new(s.user_id.clone()))
            .ok_or_else(|| {
                anyhow!(
                    "No signed-in user.\n\
                     Hint: run `cityweather configure` or pass `--user <id>`."
                )
            })
    }

    pub fn set_user(&mut self, user_id: String) {
        self.session = Some(SessionConfig { user_id });
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.retry.max_retries, self.retry.initial_delay_ms, self.retry.max_delay_ms)
    }
}
