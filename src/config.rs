//! Application configuration: YAML file with environment overrides
//!
//! Every knob has a sane default, so the config file is optional. Environment
//! variables (prefix `PARTBOT_`) win over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data_paths::DEFAULT_DATA_DIR;
use crate::portfolio::ManagerSettings;
use crate::providers::ProviderEndpoint;
use crate::types::BASE_UNIT_SCALE;

pub const DEFAULT_CONFIG_FILE: &str = "partbot.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote ledger endpoints in failover priority order
    pub providers: Vec<ProviderConfig>,
    /// Websocket event feed URL
    pub event_url: String,
    /// Root data directory (cache, logs)
    pub data_dir: PathBuf,
    /// Fallback sync poll period in seconds
    pub sync_poll_secs: u64,
    /// Transaction receipt poll period in seconds
    pub receipt_poll_secs: u64,
    /// Quiet window for debounced refreshes, in milliseconds
    pub refresh_debounce_ms: u64,
    /// Minimum buy amount in whole dollars
    pub min_buy_usd: u64,
    /// Buys accepted per UTC day
    pub daily_buy_limit: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            providers: vec![ProviderConfig {
                url: "http://127.0.0.1:8545".to_string(),
                name: "local".to_string(),
                priority: 0,
            }],
            event_url: "ws://127.0.0.1:8546/events".to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            sync_poll_secs: 30,
            receipt_poll_secs: 5,
            refresh_debounce_ms: 300,
            min_buy_usd: 1,
            daily_buy_limit: 25,
        }
    }
}

impl AppConfig {
    /// Load from `path` when it exists, otherwise start from defaults;
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a key lookup (the environment in production).
    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("PARTBOT_PROVIDER_URL") {
            self.providers = vec![ProviderConfig {
                url,
                name: "env".to_string(),
                priority: 0,
            }];
        }
        if let Some(url) = get("PARTBOT_EVENT_URL") {
            self.event_url = url;
        }
        if let Some(dir) = get("PARTBOT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = get("PARTBOT_SYNC_POLL_SECS").and_then(|v| v.parse().ok()) {
            self.sync_poll_secs = secs;
        }
        if let Some(secs) = get("PARTBOT_RECEIPT_POLL_SECS").and_then(|v| v.parse().ok()) {
            self.receipt_poll_secs = secs;
        }
        if let Some(ms) = get("PARTBOT_REFRESH_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.refresh_debounce_ms = ms;
        }
        if let Some(limit) = get("PARTBOT_DAILY_BUY_LIMIT").and_then(|v| v.parse().ok()) {
            self.daily_buy_limit = limit;
        }
    }

    /// Provider endpoints in pool form.
    pub fn provider_endpoints(&self) -> Vec<ProviderEndpoint> {
        self.providers
            .iter()
            .map(|p| ProviderEndpoint {
                url: p.url.clone(),
                name: p.name.clone(),
                priority: p.priority,
                is_active: true,
            })
            .collect()
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync_poll_secs)
    }

    /// Manager guard rails derived from the config.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            min_buy_base_units: u128::from(self.min_buy_usd) * BASE_UNIT_SCALE,
            daily_buy_limit: self.daily_buy_limit,
            refresh_debounce: Duration::from_millis(self.refresh_debounce_ms),
            receipt_poll_interval: Duration::from_secs(self.receipt_poll_secs),
            ..ManagerSettings::default()
        }
    }
}
