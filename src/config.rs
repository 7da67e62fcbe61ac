use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::keyring;

pub const DEFAULT_SYNC_SECS: u64 = 600;

pub fn default_subscriptions() -> Vec<String> {
    ["cc", "reported", "assigned", "requests"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Runtime config. The API key is always a plain String in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub server: String,
    pub username: String,
    pub api_key: String,
    pub sync_interval: Duration,
    /// Named record sets refreshed by background sync.
    pub subscriptions: Vec<String>,
    pub show_desktop_notifications: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: String::new(),
            username: String::new(),
            api_key: String::new(),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_SECS),
            subscriptions: default_subscriptions(),
            show_desktop_notifications: true,
        }
    }
}

/// On-disk representation. The API key is either a keyring reference or plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub server: String,
    pub username: String,
    pub api_key: ApiKeyBackend,
    #[serde(default = "default_sync_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<String>,
    #[serde(default = "default_true")]
    pub show_desktop_notifications: bool,
}

fn default_sync_secs() -> u64 {
    DEFAULT_SYNC_SECS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend")]
pub enum ApiKeyBackend {
    #[serde(rename = "keyring")]
    Keyring,
    #[serde(rename = "plaintext")]
    Plaintext { value: String },
}

/// What the caller must ask the user for when the config can't be resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNeedsInput {
    /// No config file exists.
    FullSetup,
    /// Config exists but the API key is missing from the keyring.
    ApiKeyOnly {
        server: String,
        username: String,
        error: Option<String>,
    },
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bugdeck")
        .join("config.json")
}

impl FileConfig {
    pub fn load() -> Result<Option<Self>, String> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|e| format!("read config: {e}"))?;
        let cfg: FileConfig =
            serde_json::from_str(&data).map_err(|e| format!("parse config: {e}"))?;
        Ok(Some(cfg))
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let data =
            serde_json::to_string_pretty(self).map_err(|e| format!("serialize config: {e}"))?;
        fs::write(path, data).map_err(|e| format!("write config: {e}"))
    }
}

impl Config {
    /// Try env vars. Returns None if any required var is missing.
    pub fn from_env() -> Option<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let server = var("BUGDECK_SERVER")?;
        let username = var("BUGDECK_USER")?;
        let api_key = var("BUGDECK_API_KEY")?;
        let sync_interval = var("BUGDECK_SYNC_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SYNC_SECS));
        let show_desktop_notifications = var("BUGDECK_NOTIFICATIONS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Some(Config {
            server,
            username,
            api_key,
            sync_interval,
            subscriptions: default_subscriptions(),
            show_desktop_notifications,
        })
    }

    /// Build runtime Config from a FileConfig + resolved API key.
    pub fn from_file_config(fc: &FileConfig, api_key: String) -> Self {
        Config {
            server: fc.server.clone(),
            username: fc.username.clone(),
            api_key,
            sync_interval: Duration::from_secs(fc.sync_interval_secs.max(1)),
            subscriptions: fc.subscriptions.clone(),
            show_desktop_notifications: fc.show_desktop_notifications,
        }
    }

    /// Store name of this account: `{host}::{username}`.
    pub fn account_name(&self) -> String {
        let host = url::Url::parse(&self.server)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| self.server.clone());
        format!("{host}::{}", self.username)
    }

    /// Resolution order: env vars → config file + keyring → Err(ConfigNeedsInput).
    pub fn resolve() -> Result<Self, ConfigNeedsInput> {
        if let Some(config) = Self::from_env() {
            log::info!("Config loaded from environment variables");
            return Ok(config);
        }

        match FileConfig::load() {
            Ok(Some(fc)) => Self::from_loaded(fc),
            Ok(None) => {
                log::info!("No config file found, need full setup");
                Err(ConfigNeedsInput::FullSetup)
            }
            Err(e) => {
                log::warn!("Config file error: {}", e);
                Err(ConfigNeedsInput::FullSetup)
            }
        }
    }

    fn from_loaded(fc: FileConfig) -> Result<Self, ConfigNeedsInput> {
        match &fc.api_key {
            ApiKeyBackend::Plaintext { value } => {
                log::info!("Config loaded from file (plaintext API key)");
                Ok(Self::from_file_config(&fc, value.clone()))
            }
            ApiKeyBackend::Keyring => match keyring::get_api_key(&fc.username, &fc.server) {
                Ok(key) => {
                    log::info!("Config loaded from file + keyring");
                    Ok(Self::from_file_config(&fc, key))
                }
                Err(e) => {
                    log::warn!("Keyring lookup failed: {}", e);
                    Err(ConfigNeedsInput::ApiKeyOnly {
                        server: fc.server,
                        username: fc.username,
                        error: Some(format!("Keyring unavailable: {e}")),
                    })
                }
            },
        }
    }
}
