//! Server configuration.
//!
//! Loaded from TOML. Every section is optional and falls back to defaults
//! suitable for a single-node development server.

use crate::broker::subject;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_ACCOUNT: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port 0 binds an ephemeral port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Seconds a new connection may take to present its CONNECT packet.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_mqtt_port(),
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default = "default_streams_enabled")]
    pub streams_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default = "default_account")]
    pub default_account: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            default_account: default_account(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    /// Account this user binds to; defaults to the default account.
    #[serde(default)]
    pub account: Option<String>,
    /// Publish allow list (subject patterns); absent means allow all.
    #[serde(default)]
    pub allow_publish: Option<Vec<String>>,
    /// Publish deny list, applied after the allow list.
    #[serde(default)]
    pub deny_publish: Option<Vec<String>>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_auth_timeout() -> u64 {
    5
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_streams_enabled() -> bool {
    true
}

fn default_account() -> String {
    DEFAULT_ACCOUNT.to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.as_os_str().is_empty() {
            bail!("storage.data_dir cannot be empty");
        }
        let mut account_names: HashSet<&str> =
            self.accounts.iter().map(|a| a.name.as_str()).collect();
        account_names.insert(self.auth.default_account.as_str());
        let mut seen_users = HashSet::new();
        for user in &self.auth.users {
            if user.username.is_empty() {
                bail!("auth user with empty username");
            }
            if !seen_users.insert(user.username.as_str()) {
                bail!("duplicate auth user {:?}", user.username);
            }
            if let Some(account) = &user.account {
                if !account_names.contains(account.as_str()) {
                    bail!(
                        "auth user {:?} references unknown account {:?}",
                        user.username,
                        account
                    );
                }
            }
            for pattern in user
                .allow_publish
                .iter()
                .flatten()
                .chain(user.deny_publish.iter().flatten())
            {
                subject::validate(pattern).with_context(|| {
                    format!("invalid permission pattern for user {:?}", user.username)
                })?;
            }
        }
        Ok(())
    }
}
